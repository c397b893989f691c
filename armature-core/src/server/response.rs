//! Response wrapper
//!
//! Buffers the response while the middleware chain and handler run: status,
//! headers, byte count and the committed flag, plus an optional compressing
//! sink the compression middleware can swap in. `finish` finalizes the sink
//! and hands the accumulated body to the HTTP engine.

use anyhow::Result;
use brotli::CompressorWriter;
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use std::io::Write;

/// Negotiated response encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Brotli,
    Gzip,
    Deflate,
}

impl Encoding {
    /// Value for the Content-Encoding header, if any.
    pub fn token(&self) -> Option<&'static str> {
        match self {
            Encoding::Identity => None,
            Encoding::Brotli => Some("br"),
            Encoding::Gzip => Some("gzip"),
            Encoding::Deflate => Some("deflate"),
        }
    }
}

enum Sink {
    Plain(Vec<u8>),
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(DeflateEncoder<Vec<u8>>),
    Brotli(Box<CompressorWriter<Vec<u8>>>),
}

impl Sink {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Sink::Plain(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Sink::Gzip(enc) => Ok(enc.write_all(data)?),
            Sink::Deflate(enc) => Ok(enc.write_all(data)?),
            Sink::Brotli(enc) => Ok(enc.write_all(data)?),
        }
    }

    fn finish(self) -> Vec<u8> {
        match self {
            Sink::Plain(buf) => buf,
            Sink::Gzip(enc) => enc.finish().unwrap_or_default(),
            Sink::Deflate(enc) => enc.finish().unwrap_or_default(),
            Sink::Brotli(mut enc) => {
                let _ = enc.flush();
                enc.into_inner()
            }
        }
    }
}

/// Buffered response under construction.
pub struct Response {
    /// Response status; 0 until written
    pub status: u16,
    /// Uncompressed bytes written by the handler
    pub size: u64,
    /// Once committed the status can no longer change
    pub committed: bool,
    headers: HeaderMap,
    sink: Sink,
    encoding: Encoding,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: 0,
            size: 0,
            committed: false,
            headers: HeaderMap::new(),
            sink: Sink::Plain(Vec::new()),
            encoding: Encoding::Identity,
        }
    }

    /// Set a header, replacing any existing value. Invalid names/values are
    /// dropped.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) =
            (name.parse::<HeaderName>(), HeaderValue::from_str(value))
        {
            self.headers.insert(name, value);
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Commit the response status. A zero code commits 200. Later calls are
    /// ignored.
    pub fn write_header(&mut self, code: u16) {
        if self.committed {
            return;
        }
        self.status = if code == 0 { 200 } else { code };
        self.committed = true;
    }

    /// Append body bytes, committing 200 first if nothing was committed yet.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.committed {
            self.write_header(200);
        }
        self.sink.write(data)?;
        self.size += data.len() as u64;
        Ok(())
    }

    /// Route subsequent writes through a compressor. Must be called before
    /// the first body write.
    pub fn set_compressor(&mut self, encoding: Encoding) {
        self.encoding = encoding;
        self.sink = match encoding {
            Encoding::Identity => Sink::Plain(Vec::new()),
            Encoding::Gzip => Sink::Gzip(GzEncoder::new(Vec::new(), Compression::default())),
            Encoding::Deflate => {
                Sink::Deflate(DeflateEncoder::new(Vec::new(), Compression::default()))
            }
            Encoding::Brotli => {
                Sink::Brotli(Box::new(CompressorWriter::new(Vec::new(), 4096, 5, 22)))
            }
        };
        if let Some(token) = encoding.token() {
            self.set_header("Content-Encoding", token);
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Finalize the sink and return `(status, headers, body)`.
    pub fn finish(self) -> (u16, HeaderMap, Vec<u8>) {
        let status = if self.status == 0 { 200 } else { self.status };
        (status, self.headers, self.sink.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn write_commits_200() {
        let mut res = Response::new();
        res.write(b"hello").unwrap();
        assert!(res.committed);
        assert_eq!(res.status, 200);
        assert_eq!(res.size, 5);

        let (status, _, body) = res.finish();
        assert_eq!(status, 200);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn status_is_sticky_once_committed() {
        let mut res = Response::new();
        res.write_header(404);
        res.write_header(200);
        assert_eq!(res.status, 404);
    }

    #[test]
    fn gzip_sink_roundtrip() {
        let mut res = Response::new();
        res.set_compressor(Encoding::Gzip);
        res.write(b"payload payload payload").unwrap();
        assert_eq!(res.header("Content-Encoding"), Some("gzip"));

        let (_, _, body) = res.finish();
        let mut decoder = flate2::read::GzDecoder::new(body.as_slice());
        let mut decoded = String::new();
        decoder.read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, "payload payload payload");
    }

    #[test]
    fn brotli_sink_produces_output() {
        let mut res = Response::new();
        res.set_compressor(Encoding::Brotli);
        res.write(b"some compressible body some compressible body").unwrap();

        let (_, _, body) = res.finish();
        assert!(!body.is_empty());

        let mut decoded = Vec::new();
        brotli::BrotliDecompress(&mut body.as_slice(), &mut decoded).unwrap();
        assert_eq!(decoded, b"some compressible body some compressible body");
    }

    #[test]
    fn size_counts_uncompressed_bytes() {
        let mut res = Response::new();
        res.set_compressor(Encoding::Gzip);
        res.write(b"0123456789").unwrap();
        assert_eq!(res.size, 10);
    }
}
