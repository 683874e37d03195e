//! Authority RPC: wire protocol, handler registry and the gateway

mod gateway;
mod protocol;
mod registry;

pub use gateway::{CallOptions, RpcGateway};
pub use protocol::{
    dedupe_key, idempotency_key, ErrorCode, RpcFailure, RpcRequest, RpcResponse, RpcResult,
    IDEMPOTENCY_KEY_FIELD,
};
pub use registry::{decode_payload, HandlerRegistry, IdempotencyLedger, RpcContext, RpcHandler};
