pub mod protocol;
pub mod reader;
pub mod state;
pub mod stream;
pub mod writer;
