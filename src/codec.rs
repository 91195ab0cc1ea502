//! File codecs read and write the records inside one [`crate::registry::RegistryEntry`]'s
//! backing file. The wire format is an external contract (concrete encodings for ORC and
//! SequenceFile are out of scope per the design); what's specified here is the reader/writer
//! contract every codec must honor, plus a fully worked-out delimited implementation.

use crate::error::{Result, SecoriteError};
use flate2::{read::GzDecoder, write::GzEncoder, Compression as GzCompression};
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Read, Write},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// The unit a [`FileCodec`] reads and writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub offset: u64,
    pub value: Vec<u8>,
}

/// Compression applied to the on-disk bytes, independent of the record framing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

/// Maps a Kafka compression codec name to the ORC compression kind it would be written with.
/// The ORC writer itself is a contract-level stub (see [`OrcCodec`]), but callers that need to
/// pick the right kind for a topic can use this regardless.
pub fn orc_compression_for(kafka_codec: &str) -> &'static str {
    match kafka_codec.to_ascii_lowercase().as_str() {
        "lz4" => "LZ4",
        "snappy" => "SNAPPY",
        "gzip" => "ZLIB",
        _ => "NONE",
    }
}

/// Writer contract shared by every codec: append, report the on-disk byte count (post
/// compression, since that's what the size-based commit policy thresholds against), and flush
/// on close.
pub trait FileCodecWriter: Send {
    fn write(&mut self, kv: &KeyValue) -> Result<()>;
    /// On-disk byte count written so far, after compression.
    fn length(&self) -> u64;
    fn close(self: Box<Self>) -> Result<()>;
}

/// Reader contract shared by every codec. Offsets are not encoded in delimited records, so the
/// reader is told the path's first offset and increments by one per record read.
pub trait FileCodecReader: Send {
    fn next(&mut self) -> Result<Option<KeyValue>>;
}

/// Factory for a chosen record format + compression.
pub trait FileCodec: Send + Sync {
    fn open_writer(&self, path: &Path) -> Result<Box<dyn FileCodecWriter>>;
    fn open_reader(&self, path: &Path, first_offset: u64) -> Result<Box<dyn FileCodecReader>>;
}

fn io_err(operation: &'static str, err: std::io::Error) -> SecoriteError {
    SecoriteError::TransientIo {
        operation,
        source: err.into(),
    }
}

struct CountingWriter<W> {
    inner: W,
    counter: Arc<AtomicU64>,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.counter.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

enum WriterSink {
    Plain(CountingWriter<BufWriter<File>>),
    Gzip(GzEncoder<CountingWriter<BufWriter<File>>>),
}

impl Write for WriterSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            WriterSink::Plain(w) => w.write(buf),
            WriterSink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            WriterSink::Plain(w) => w.flush(),
            WriterSink::Gzip(w) => w.flush(),
        }
    }
}

/// Byte-framed codec: records are written back to back with an optional trailing delimiter
/// byte. The writer appends the delimiter iff one is configured; an empty writer delimiter
/// means "do not append a delimiter at all".
pub struct DelimitedCodec {
    pub reader_delimiter: u8,
    pub writer_delimiter: Option<u8>,
    pub compression: Compression,
}

impl FileCodec for DelimitedCodec {
    fn open_writer(&self, path: &Path) -> Result<Box<dyn FileCodecWriter>> {
        let file = File::create(path).map_err(|e| io_err("create codec writer file", e))?;
        let counter = Arc::new(AtomicU64::new(0));
        let counting = CountingWriter {
            inner: BufWriter::new(file),
            counter: counter.clone(),
        };

        let sink = match self.compression {
            Compression::None => WriterSink::Plain(counting),
            Compression::Gzip => WriterSink::Gzip(GzEncoder::new(counting, GzCompression::default())),
        };

        Ok(Box::new(DelimitedWriter {
            sink,
            counter,
            delimiter: self.writer_delimiter,
        }))
    }

    fn open_reader(&self, path: &Path, first_offset: u64) -> Result<Box<dyn FileCodecReader>> {
        let file = File::open(path).map_err(|e| io_err("open codec reader file", e))?;

        let reader: Box<dyn BufRead + Send> = match self.compression {
            Compression::None => Box::new(BufReader::new(file)),
            Compression::Gzip => Box::new(BufReader::new(GzDecoder::new(file))),
        };

        Ok(Box::new(DelimitedReader {
            reader,
            delimiter: self.reader_delimiter,
            next_offset: first_offset,
        }))
    }
}

struct DelimitedWriter {
    sink: WriterSink,
    counter: Arc<AtomicU64>,
    delimiter: Option<u8>,
}

impl FileCodecWriter for DelimitedWriter {
    fn write(&mut self, kv: &KeyValue) -> Result<()> {
        self.sink
            .write_all(&kv.value)
            .map_err(|e| io_err("write record", e))?;

        if let Some(d) = self.delimiter {
            self.sink
                .write_all(&[d])
                .map_err(|e| io_err("write delimiter", e))?;
        }

        Ok(())
    }

    fn length(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    fn close(self: Box<Self>) -> Result<()> {
        match self.sink {
            WriterSink::Plain(mut w) => w.flush().map_err(|e| io_err("flush writer", e)),
            WriterSink::Gzip(w) => w.finish().map(|_| ()).map_err(|e| io_err("finish gzip writer", e)),
        }
    }
}

struct DelimitedReader {
    reader: Box<dyn BufRead + Send>,
    delimiter: u8,
    next_offset: u64,
}

impl FileCodecReader for DelimitedReader {
    fn next(&mut self) -> Result<Option<KeyValue>> {
        let mut buf = Vec::new();
        let n = self
            .reader
            .read_until(self.delimiter, &mut buf)
            .map_err(|e| io_err("read record", e))?;

        if n == 0 {
            return Ok(None);
        }

        let ends_with_delimiter = buf.last() == Some(&self.delimiter);
        if ends_with_delimiter {
            buf.pop();
        } else {
            // Bytes were read but no delimiter was found before EOF: the file was truncated
            // mid-record.
            return Err(SecoriteError::InvariantViolation(
                "framing error: bytes without delimiter at EOF".to_string(),
            ));
        }

        let kv = KeyValue {
            offset: self.next_offset,
            value: buf,
        };
        self.next_offset += 1;
        Ok(Some(kv))
    }
}

/// Hadoop key/value record codec. The real SequenceFile binary format is out of scope (it's an
/// external collaborator per the design); this is a length-prefixed stand-in that satisfies the
/// same reader/writer contract so the rest of the pipeline is agnostic to which codec is chosen.
pub struct SequenceFileCodec;

impl FileCodec for SequenceFileCodec {
    fn open_writer(&self, path: &Path) -> Result<Box<dyn FileCodecWriter>> {
        let file = File::create(path).map_err(|e| io_err("create codec writer file", e))?;
        let counter = Arc::new(AtomicU64::new(0));
        Ok(Box::new(LengthPrefixedWriter {
            writer: CountingWriter {
                inner: BufWriter::new(file),
                counter: counter.clone(),
            },
            counter,
        }))
    }

    fn open_reader(&self, path: &Path, first_offset: u64) -> Result<Box<dyn FileCodecReader>> {
        let file = File::open(path).map_err(|e| io_err("open codec reader file", e))?;
        Ok(Box::new(LengthPrefixedReader {
            reader: BufReader::new(file),
            next_offset: first_offset,
        }))
    }
}

/// Columnar codec requiring a schema per topic. The real ORC writer is out of scope; missing a
/// schema for a topic is a fatal [`SecoriteError::Schema`] for that topic's loop, per the design.
pub struct OrcCodec {
    pub schema: Option<String>,
}

impl FileCodec for OrcCodec {
    fn open_writer(&self, path: &Path) -> Result<Box<dyn FileCodecWriter>> {
        let Some(_schema) = &self.schema else {
            return Err(SecoriteError::Schema {
                topic: path.display().to_string(),
                source: anyhow::anyhow!("no ORC schema configured for this topic"),
            });
        };

        let file = File::create(path).map_err(|e| io_err("create codec writer file", e))?;
        let counter = Arc::new(AtomicU64::new(0));
        Ok(Box::new(LengthPrefixedWriter {
            writer: CountingWriter {
                inner: BufWriter::new(file),
                counter: counter.clone(),
            },
            counter,
        }))
    }

    fn open_reader(&self, path: &Path, first_offset: u64) -> Result<Box<dyn FileCodecReader>> {
        let Some(_schema) = &self.schema else {
            return Err(SecoriteError::Schema {
                topic: path.display().to_string(),
                source: anyhow::anyhow!("no ORC schema configured for this topic"),
            });
        };

        let file = File::open(path).map_err(|e| io_err("open codec reader file", e))?;
        Ok(Box::new(LengthPrefixedReader {
            reader: BufReader::new(file),
            next_offset: first_offset,
        }))
    }
}

struct LengthPrefixedWriter {
    writer: CountingWriter<BufWriter<File>>,
    counter: Arc<AtomicU64>,
}

impl FileCodecWriter for LengthPrefixedWriter {
    fn write(&mut self, kv: &KeyValue) -> Result<()> {
        let len = kv.value.len() as u32;
        self.writer
            .write_all(&len.to_be_bytes())
            .map_err(|e| io_err("write record length", e))?;
        self.writer
            .write_all(&kv.value)
            .map_err(|e| io_err("write record", e))
    }

    fn length(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.writer.flush().map_err(|e| io_err("flush writer", e))
    }
}

struct LengthPrefixedReader {
    reader: BufReader<File>,
    next_offset: u64,
}

impl FileCodecReader for LengthPrefixedReader {
    fn next(&mut self) -> Result<Option<KeyValue>> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(io_err("read record length", e)),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        let mut value = vec![0u8; len];
        self.reader
            .read_exact(&mut value)
            .map_err(|e| io_err("read record", e))?;

        let kv = KeyValue {
            offset: self.next_offset,
            value,
        };
        self.next_offset += 1;
        Ok(Some(kv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn s4_delimited_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0_3_00000000000000000005.log");

        let codec = DelimitedCodec {
            reader_delimiter: b'\n',
            writer_delimiter: Some(b'\n'),
            compression: Compression::None,
        };

        let mut writer = codec.open_writer(&path).unwrap();
        writer.write(&KeyValue { offset: 5, value: b"b0".to_vec() }).unwrap();
        writer.write(&KeyValue { offset: 6, value: b"b1".to_vec() }).unwrap();
        writer.write(&KeyValue { offset: 7, value: b"b2".to_vec() }).unwrap();
        assert!(writer.length() > 0);
        writer.close().unwrap();

        let mut reader = codec.open_reader(&path, 5).unwrap();
        let r1 = reader.next().unwrap().unwrap();
        let r2 = reader.next().unwrap().unwrap();
        let r3 = reader.next().unwrap().unwrap();
        assert!(reader.next().unwrap().is_none());

        assert_eq!(r1, KeyValue { offset: 5, value: b"b0".to_vec() });
        assert_eq!(r2, KeyValue { offset: 6, value: b"b1".to_vec() });
        assert_eq!(r3, KeyValue { offset: 7, value: b"b2".to_vec() });
    }

    #[test]
    fn framing_error_on_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.log");

        {
            let mut f = File::create(&path).unwrap();
            f.write_all(b"complete\ntrailing-without-delimiter").unwrap();
        }

        let codec = DelimitedCodec {
            reader_delimiter: b'\n',
            writer_delimiter: Some(b'\n'),
            compression: Compression::None,
        };

        let mut reader = codec.open_reader(&path, 0).unwrap();
        assert!(reader.next().unwrap().is_some());
        assert!(reader.next().is_err());
    }

    #[test]
    fn gzip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0_0_00000000000000000000.log.gz");

        let codec = DelimitedCodec {
            reader_delimiter: b'\n',
            writer_delimiter: Some(b'\n'),
            compression: Compression::Gzip,
        };

        let mut writer = codec.open_writer(&path).unwrap();
        writer.write(&KeyValue { offset: 0, value: b"hello".to_vec() }).unwrap();
        writer.close().unwrap();

        let mut reader = codec.open_reader(&path, 0).unwrap();
        let kv = reader.next().unwrap().unwrap();
        assert_eq!(kv.value, b"hello");
    }

    #[test]
    fn orc_codec_requires_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema-less.orc");
        let codec = OrcCodec { schema: None };
        assert!(codec.open_writer(&path).is_err());
    }
}
