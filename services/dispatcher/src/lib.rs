pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod egress;
pub mod ingress;
pub mod liveness;
pub mod queue;
pub mod registry;
pub mod session;
pub mod ws;

pub use dispatcher::Dispatcher;
pub use ingress::{ClientFrame, ClientSink, Connection, Responder};
