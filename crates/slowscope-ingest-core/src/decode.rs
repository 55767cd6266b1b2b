use crate::error::DecodeError;
use flate2::bufread::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub type LogStream = Box<dyn BufRead + Send>;

pub fn is_compressed(name: &Path) -> bool {
    name.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// Opens a log file for single-pass line reading, decompressing `.gz` files.
pub fn open_log_stream(path: &Path) -> Result<LogStream, DecodeError> {
    let file = File::open(path).map_err(|source| DecodeError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    decode_reader(path, file)
}

/// Wraps an arbitrary byte source; `name` decides whether it is gzip.
pub fn decode_reader<R>(name: &Path, reader: R) -> Result<LogStream, DecodeError>
where
    R: Read + Send + 'static,
{
    let mut buffered = BufReader::new(reader);
    if !is_compressed(name) {
        return Ok(Box::new(buffered));
    }

    let head = buffered.fill_buf().map_err(|source| DecodeError::Open {
        path: name.to_path_buf(),
        source,
    })?;
    // An empty archive decodes to an empty stream.
    if !head.is_empty() && !head.starts_with(&GZIP_MAGIC) {
        return Err(DecodeError::InvalidCompression {
            path: name.to_path_buf(),
        });
    }

    Ok(Box::new(BufReader::new(MultiGzDecoder::new(buffered))))
}

/// Line iterator over a decoded stream. Lines are split on `\n`, a trailing
/// `\r` is dropped, and invalid UTF-8 is replaced rather than rejected.
pub struct LogLines {
    path: PathBuf,
    stream: LogStream,
    buf: Vec<u8>,
    line_no: u64,
}

impl LogLines {
    pub fn new(path: impl Into<PathBuf>, stream: LogStream) -> Self {
        Self {
            path: path.into(),
            stream,
            buf: Vec::new(),
            line_no: 0,
        }
    }

    pub fn line_no(&self) -> u64 {
        self.line_no
    }

    /// Next line, or `None` at end of stream.
    pub fn next_line(&mut self) -> Result<Option<String>, DecodeError> {
        self.buf.clear();
        let bytes_read = self
            .stream
            .read_until(b'\n', &mut self.buf)
            .map_err(|source| DecodeError::Read {
                path: self.path.clone(),
                source,
            })?;

        if bytes_read == 0 {
            return Ok(None);
        }

        self.line_no = self.line_no.saturating_add(1);
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if text.ends_with('\n') {
            text.pop();
            if text.ends_with('\r') {
                text.pop();
            }
        }
        Ok(Some(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Write};

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).expect("compress");
        encoder.finish().expect("finish")
    }

    fn collect(mut lines: LogLines) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().expect("read line") {
            out.push(line);
        }
        out
    }

    #[test]
    fn plain_source_yields_lines() {
        let stream = decode_reader(
            Path::new("mongod.log"),
            Cursor::new(b"first\r\nsecond\nthird".to_vec()),
        )
        .expect("plain stream");
        assert_eq!(
            collect(LogLines::new("mongod.log", stream)),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn gzip_source_is_decompressed() {
        let stream = decode_reader(
            Path::new("mongod.log.GZ"),
            Cursor::new(gzip(b"alpha\nbeta\n")),
        )
        .expect("gzip stream");
        assert_eq!(
            collect(LogLines::new("mongod.log.GZ", stream)),
            vec!["alpha", "beta"]
        );
    }

    #[test]
    fn concatenated_gzip_members_are_read_through() {
        let mut data = gzip(b"one\n");
        data.extend(gzip(b"two\n"));
        let stream =
            decode_reader(Path::new("rotated.gz"), Cursor::new(data)).expect("gzip stream");
        assert_eq!(collect(LogLines::new("rotated.gz", stream)), vec!["one", "two"]);
    }

    #[test]
    fn bad_gzip_header_is_a_decode_error() {
        let err = decode_reader(
            Path::new("mongod.log.gz"),
            Cursor::new(b"{\"t\":{}}\n".to_vec()),
        )
        .err()
        .expect("invalid gzip should fail");
        assert!(matches!(err, DecodeError::InvalidCompression { .. }));
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let err = open_log_stream(Path::new("/definitely/missing/mongod.log.gz"))
            .err()
            .expect("missing file should fail");
        assert!(matches!(err, DecodeError::Open { .. }));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let stream = decode_reader(
            Path::new("mongod.log"),
            Cursor::new(vec![b'o', b'k', 0xff, b'\n']),
        )
        .expect("plain stream");
        let lines = collect(LogLines::new("mongod.log", stream));
        assert_eq!(lines, vec!["ok\u{fffd}".to_string()]);
    }
}
