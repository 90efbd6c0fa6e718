pub mod message;
pub mod transport;
pub mod server;

pub use message::{DiskRequest, DiskResponse, Request, Response, Tid, VoteRequest, VoteResponse};
pub use transport::Connection;
