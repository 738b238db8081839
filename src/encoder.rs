//! Response serialization.
//!
//! A response goes out either with a computed `Content-Length` or with
//! `Transfer-Encoding: chunked`, optionally gzip-compressed first.
use std::io::{self, Write};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::http::{Response, CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING};

const HTTP_VERSION: &str = "HTTP/1.1";

/// Serializes responses onto a connection.
#[derive(Debug, Clone)]
pub struct ResponseEncoder {
    chunk_size: usize,
    compression: Compression,
}

impl Default for ResponseEncoder {
    fn default() -> Self {
        ResponseEncoder::new(1024)
    }
}

impl ResponseEncoder {
    /// `chunk_size` is the payload size of every chunk but the last. Zero is
    /// treated as one.
    pub fn new(chunk_size: usize) -> Self {
        ResponseEncoder {
            chunk_size: chunk_size.max(1),
            compression: Compression::default(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Gzips the body of a response marked for it and sets
    /// `Content-Encoding: gzip`. If compression fails the body is left as
    /// it was and the response goes out uncompressed.
    pub fn maybe_compress(&self, response: &mut Response) {
        if !response.wants_gzip() {
            return;
        }
        response.set_gzip(false);

        let body = response.take_body();
        match self.gzip(&body) {
            Ok(compressed) => {
                response.set_body(compressed);
                response.set_header(CONTENT_ENCODING, "gzip");
            }
            Err(e) => {
                log::warn!("gzip failed, sending uncompressed body: {}", e);
                response.set_body(body);
            }
        }
    }

    fn gzip(&self, body: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), self.compression);
        encoder.write_all(body)?;
        encoder.finish()
    }

    /// Status line, headers, computed `Content-Length`, blank line, body.
    pub fn encode_fixed(&self, response: &Response) -> Vec<u8> {
        let body = response.body();
        let mut out = self.head(response, 32 + body.len());
        out.extend_from_slice(format!("{}: {}\r\n\r\n", CONTENT_LENGTH, body.len()).as_bytes());
        out.extend_from_slice(body);
        out
    }

    /// The writes making up a chunked response: the head, one entry per
    /// chunk, and the terminating zero-length chunk.
    pub fn encode_chunked(&self, response: &Response) -> Vec<Vec<u8>> {
        let body = response.body();
        let mut writes = Vec::with_capacity(2 + body.len() / self.chunk_size);

        let mut head = self.head(response, 32);
        head.extend_from_slice(format!("{}: chunked\r\n\r\n", TRANSFER_ENCODING).as_bytes());
        writes.push(head);

        for chunk in body.chunks(self.chunk_size) {
            let mut frame = Vec::with_capacity(chunk.len() + 12);
            frame.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            frame.extend_from_slice(chunk);
            frame.extend_from_slice(b"\r\n");
            writes.push(frame);
        }

        writes.push(b"0\r\n\r\n".to_vec());
        writes
    }

    /// Compresses if requested, picks fixed or chunked framing and writes
    /// the result to `out`. A failed write aborts the rest of the response.
    pub fn write_response<W: Write>(&self, response: &mut Response, out: &mut W) -> io::Result<()> {
        self.maybe_compress(response);

        if response.is_chunked() {
            for part in self.encode_chunked(response) {
                out.write_all(&part)?;
            }
        } else {
            out.write_all(&self.encode_fixed(response))?;
        }

        out.flush()
    }

    /// Status line and every header except the framing ones, which are
    /// always computed here.
    fn head(&self, response: &Response, extra: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + extra);
        out.extend_from_slice(
            format!("{} {} {}\r\n", HTTP_VERSION, response.status(), response.reason()).as_bytes(),
        );

        for (name, value) in response.headers() {
            if name.eq_ignore_ascii_case(CONTENT_LENGTH)
                || name.eq_ignore_ascii_case(TRANSFER_ENCODING)
            {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    /// Reassembles a chunked body, checking each frame's declared length.
    fn dechunk(frames: &[Vec<u8>]) -> (Vec<usize>, Vec<u8>) {
        let mut sizes = Vec::new();
        let mut body = Vec::new();
        for frame in frames {
            let line_end = frame.windows(2).position(|w| w == b"\r\n").unwrap();
            let size = usize::from_str_radix(std::str::from_utf8(&frame[..line_end]).unwrap(), 16).unwrap();
            let payload = &frame[line_end + 2..];
            assert_eq!(&payload[size..], b"\r\n");
            body.extend_from_slice(&payload[..size]);
            sizes.push(size);
        }
        (sizes, body)
    }

    #[test]
    fn test_fixed_encoding() {
        let mut response = Response::new();
        response.set_header("Connection", "keep-alive");
        response.set_body("Hello, World!");

        let bytes = ResponseEncoder::default().encode_fixed(&response);
        assert_eq!(
            bytes,
            b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 13\r\n\r\nHello, World!"
        );
    }

    /// A Content-Length set by a handler is replaced by the real length.
    #[test]
    fn test_fixed_overrides_handler_length() {
        let mut response = Response::new();
        response.set_status(404);
        response.set_header("Content-Length", "999");
        response.set_body("nope");

        let text = String::from_utf8(ResponseEncoder::default().encode_fixed(&response)).unwrap();
        assert_eq!(text, "HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\n\r\nnope");
    }

    /// A body of k*N + r bytes yields k full chunks, one of r bytes and the
    /// zero chunk; the payloads concatenate back to the body.
    #[test]
    fn test_chunked_encoding() {
        let body: Vec<u8> = (0..2 * 16 + 5).map(|i| b'a' + (i % 26) as u8).collect();
        let mut response = Response::new();
        response.set_chunked(true).set_body(body.clone());

        let writes = ResponseEncoder::new(16).encode_chunked(&response);
        let head = String::from_utf8(writes[0].clone()).unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.ends_with("Transfer-Encoding: chunked\r\n\r\n"));
        assert!(!head.contains("Content-Length"));

        let (sizes, payload) = dechunk(&writes[1..]);
        assert_eq!(sizes, vec![16, 16, 5, 0]);
        assert_eq!(payload, body);
        assert_eq!(writes.last().unwrap(), b"0\r\n\r\n");
    }

    #[test]
    fn test_chunked_empty_body() {
        let response = Response::new();
        let writes = ResponseEncoder::new(8).encode_chunked(&response);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1], b"0\r\n\r\n");
    }

    /// Chunk lengths are written in hex.
    #[test]
    fn test_chunk_size_hex() {
        let mut response = Response::new();
        response.set_body(vec![b'x'; 300]);
        let writes = ResponseEncoder::new(1024).encode_chunked(&response);
        assert!(writes[1].starts_with(b"12c\r\n"));
    }

    #[test]
    fn test_gzip_compression() {
        let body = "compress me ".repeat(100);
        let mut response = Response::new();
        response.set_gzip(true).set_body(body.clone());

        let encoder = ResponseEncoder::default();
        encoder.maybe_compress(&mut response);

        assert_eq!(response.header("Content-Encoding"), Some("gzip"));
        assert!(response.body().len() < body.len());
        assert!(!response.wants_gzip());

        let mut decoded = String::new();
        GzDecoder::new(response.body().as_ref())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_no_gzip_unless_marked() {
        let mut response = Response::new();
        response.set_body("plain");
        ResponseEncoder::default().maybe_compress(&mut response);
        assert_eq!(response.header("Content-Encoding"), None);
        assert_eq!(response.body().as_ref(), b"plain");
    }

    /// write_response picks chunked framing when the header asks for it.
    #[test]
    fn test_write_response_chunked_via_header() {
        let mut response = Response::new();
        response.set_header("Transfer-Encoding", "chunked");
        response.set_body("abc");

        let mut out = Vec::new();
        ResponseEncoder::new(2).write_response(&mut response, &mut out).unwrap();
        assert_eq!(
            out,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nab\r\n1\r\nc\r\n0\r\n\r\n"
        );
    }

    /// Framing headers are recognized in any case and never duplicated.
    #[test]
    fn test_framing_headers_case_insensitive() {
        let mut response = Response::new();
        response.set_header("content-length", "999");
        response.set_body("nope");
        let text = String::from_utf8(ResponseEncoder::default().encode_fixed(&response)).unwrap();
        assert_eq!(text, "HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nnope");

        let mut response = Response::new();
        response.set_header("transfer-encoding", "chunked");
        response.set_body("abc");
        let mut out = Vec::new();
        ResponseEncoder::new(2).write_response(&mut response, &mut out).unwrap();
        assert_eq!(
            out,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nab\r\n1\r\nc\r\n0\r\n\r\n"
        );
    }

    /// A write failure surfaces to the caller.
    #[test]
    fn test_write_failure() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut response = Response::new();
        let err = ResponseEncoder::default()
            .write_response(&mut response, &mut Broken)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
