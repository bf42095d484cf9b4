//! Remote L2 store and the value codec.
//!
//! [`L2Store`] abstracts the remote tier so the cache facade degrades and
//! the tests run without a live server.  [`RedisStore`] is the production
//! implementation.
//!
//! # Value encoding
//! Every stored value carries a one-byte algorithm marker (0 = none,
//! 1 = gzip, 2 = lz4) so readers never depend on configuration to
//! decompress.  Values at or above the caller's threshold are compressed;
//! smaller values are stored marked-uncompressed.

use crate::config::CompressionAlgo;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::future::Future;
use std::io::{Read, Write};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum L2Error {
    #[error("L2 unavailable: {0}")]
    Unavailable(String),
    #[error("L2 operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("compression: {0}")]
    Compression(String),
    #[error("decompression: {0}")]
    Decompression(String),
}

// ---------------------------------------------------------------------------
// L2Store trait
// ---------------------------------------------------------------------------

/// The remote tier seam.  Implementations must be cheap to call
/// concurrently; the facade never serializes access.
#[async_trait]
pub trait L2Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, L2Error>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), L2Error>;
    async fn delete(&self, key: &str) -> Result<(), L2Error>;
    /// Batched get; the result vector is positionally aligned with `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, L2Error>;
    /// Delete every key starting with `prefix`; returns the count.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, L2Error>;
    /// Liveness probe, used by the failover health check.
    async fn ping(&self) -> Result<(), L2Error>;
}

// ---------------------------------------------------------------------------
// RedisStore
// ---------------------------------------------------------------------------

/// Bound on every remote call; a hung server degrades to failover instead
/// of stalling the intake loop.
const OP_TIMEOUT: Duration = Duration::from_secs(5);

async fn bounded<T>(
    op: impl Future<Output = redis::RedisResult<T>>,
) -> Result<T, L2Error> {
    match tokio::time::timeout(OP_TIMEOUT, op).await {
        Ok(result) => result.map_err(|e| L2Error::Unavailable(e.to_string())),
        Err(_) => Err(L2Error::Timeout(OP_TIMEOUT)),
    }
}

/// Redis-backed L2 tier.
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect to the configured endpoint.  The connection manager retries
    /// internally; a dead endpoint surfaces as per-call errors.
    pub async fn connect(url: &str) -> Result<Self, L2Error> {
        let client =
            redis::Client::open(url).map_err(|e| L2Error::Unavailable(e.to_string()))?;
        let manager = bounded(client.get_connection_manager()).await?;
        Ok(RedisStore { manager })
    }
}

#[async_trait]
impl L2Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, L2Error> {
        let mut con = self.manager.clone();
        bounded(con.get(key)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), L2Error> {
        let mut con = self.manager.clone();
        bounded(con.set_ex(key, value, ttl.as_secs().max(1))).await
    }

    async fn delete(&self, key: &str) -> Result<(), L2Error> {
        let mut con = self.manager.clone();
        bounded(con.del(key)).await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, L2Error> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut con = self.manager.clone();
        // MGET via explicit command so a single key still yields an array.
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        bounded(cmd.query_async(&mut con)).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, L2Error> {
        let mut con = self.manager.clone();
        let keys: Vec<String> = bounded(con.keys(format!("{prefix}*"))).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let count = keys.len() as u64;
        bounded::<()>(con.del(keys)).await?;
        Ok(count)
    }

    async fn ping(&self) -> Result<(), L2Error> {
        let mut con = self.manager.clone();
        bounded::<()>(redis::cmd("PING").query_async(&mut con)).await
    }
}

// ---------------------------------------------------------------------------
// Value codec
// ---------------------------------------------------------------------------

const MARKER_PLAIN: u8 = 0;
const MARKER_GZIP: u8 = 1;
const MARKER_LZ4: u8 = 2;

/// Encode a serialized value for L2: marker byte plus body, compressing
/// when the body reaches `threshold` bytes.
pub fn encode_value(
    body: &[u8],
    threshold: usize,
    algo: CompressionAlgo,
) -> Result<Vec<u8>, L2Error> {
    if body.len() < threshold {
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(MARKER_PLAIN);
        out.extend_from_slice(body);
        return Ok(out);
    }
    match algo {
        CompressionAlgo::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(vec![MARKER_GZIP], flate2::Compression::default());
            encoder
                .write_all(body)
                .map_err(|e| L2Error::Compression(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| L2Error::Compression(e.to_string()))
        }
        CompressionAlgo::Lz4 => {
            let compressed = lz4::block::compress(body, None, true)
                .map_err(|e| L2Error::Compression(e.to_string()))?;
            let mut out = Vec::with_capacity(compressed.len() + 1);
            out.push(MARKER_LZ4);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
    }
}

/// Decode an L2 value, detecting the algorithm from the stored marker.
pub fn decode_value(stored: &[u8]) -> Result<Vec<u8>, L2Error> {
    let Some((&marker, body)) = stored.split_first() else {
        return Err(L2Error::Decompression("empty stored value".to_owned()));
    };
    match marker {
        MARKER_PLAIN => Ok(body.to_vec()),
        MARKER_GZIP => {
            // Gzip output starts after the marker we emitted first.
            let mut decoder = flate2::read::GzDecoder::new(body);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| L2Error::Decompression(e.to_string()))?;
            Ok(out)
        }
        MARKER_LZ4 => {
            lz4::block::decompress(body, None).map_err(|e| L2Error::Decompression(e.to_string()))
        }
        other => Err(L2Error::Decompression(format!("unknown marker byte {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_values_are_stored_plain() {
        let encoded = encode_value(b"tiny", 1024, CompressionAlgo::Gzip).unwrap();
        assert_eq!(encoded[0], MARKER_PLAIN);
        assert_eq!(decode_value(&encoded).unwrap(), b"tiny");
    }

    #[test]
    fn gzip_round_trips_above_threshold() {
        let body = vec![b'x'; 4096];
        let encoded = encode_value(&body, 1024, CompressionAlgo::Gzip).unwrap();
        assert_eq!(encoded[0], MARKER_GZIP);
        assert!(encoded.len() < body.len());
        assert_eq!(decode_value(&encoded).unwrap(), body);
    }

    #[test]
    fn lz4_round_trips_above_threshold() {
        let body = vec![b'y'; 4096];
        let encoded = encode_value(&body, 1024, CompressionAlgo::Lz4).unwrap();
        assert_eq!(encoded[0], MARKER_LZ4);
        assert_eq!(decode_value(&encoded).unwrap(), body);
    }

    #[test]
    fn decoder_never_consults_the_writer_algo() {
        // A gzip-written value decodes in a process configured for lz4.
        let body = vec![b'z'; 2048];
        let encoded = encode_value(&body, 1024, CompressionAlgo::Gzip).unwrap();
        assert_eq!(decode_value(&encoded).unwrap(), body);
    }

    #[test]
    fn threshold_boundary_compresses_at_exact_size() {
        let body = vec![b'a'; 1024];
        let encoded = encode_value(&body, 1024, CompressionAlgo::Gzip).unwrap();
        assert_eq!(encoded[0], MARKER_GZIP);
        let encoded = encode_value(&body[..1023], 1024, CompressionAlgo::Gzip).unwrap();
        assert_eq!(encoded[0], MARKER_PLAIN);
    }

    #[test]
    fn unknown_marker_is_a_decompression_error() {
        assert!(matches!(
            decode_value(&[9, 1, 2, 3]),
            Err(L2Error::Decompression(_))
        ));
        assert!(matches!(decode_value(&[]), Err(L2Error::Decompression(_))));
    }
}
