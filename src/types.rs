pub use amq_protocol::types::*;
