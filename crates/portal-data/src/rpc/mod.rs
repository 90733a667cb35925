pub mod batch;
pub mod methods;
pub mod transport;
pub mod types;

pub use batch::BatchClient;
pub use transport::{HandlerTransport, HttpTransport, RpcTransport};
pub use types::{RpcErrorObject, RpcRequest, RpcResponse};
