pub mod gateway;

pub use gateway::{FetchedMessage, MessageGateway};
