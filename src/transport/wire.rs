//! JSON-RPC 2.0 messages and the length-prefixed frame codec that carries them.

use std::marker::PhantomData;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Maximum frame payload size: 4 MB.
const MAX_FRAME_SIZE: usize = 4 * 1_048_576;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// 4-byte big-endian length prefix followed by a JSON body.
///
/// Decodes `D` and encodes `E`, so the client side is
/// `FrameCodec<RpcResponse, RpcRequest>` and a server is the mirror image.
pub struct FrameCodec<D, E> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<fn(E) -> D>,
}

impl<D, E> FrameCodec<D, E> {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_SIZE)
            .length_adjustment(0)
            .new_codec();

        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<D, E> Default for FrameCodec<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Codec used by [`super::RpcClient`].
pub type ClientCodec = FrameCodec<RpcResponse, RpcRequest>;

impl<D, E: Serialize> Encoder<E> for FrameCodec<D, E> {
    type Error = anyhow::Error;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).context("failed to serialize message")?;
        self.inner
            .encode(Bytes::from(json), dst)
            .map_err(|e| anyhow::anyhow!(e))
    }
}

impl<D: DeserializeOwned, E> Decoder for FrameCodec<D, E> {
    type Item = D;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src).map_err(|e| anyhow::anyhow!(e))? {
            Some(bytes) => {
                let msg = serde_json::from_slice(&bytes).context("failed to deserialize message")?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}
