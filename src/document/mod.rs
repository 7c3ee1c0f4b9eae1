pub mod codec;
pub mod model;

pub use codec::{Encoder, JsonEncoder};
pub use model::{Description, Document, Product};
