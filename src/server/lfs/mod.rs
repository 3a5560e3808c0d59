mod dto;
mod handlers;

pub use handlers::{batch, batch_for, complete_multipart, verify};
