//! Incremental page boundary scanner over a (possibly compressed) dump.
//!
//! The stream never parses XML. It looks for `<page>` / `</page>` markers in
//! a rolling buffer of decompressed bytes and hands out each complete record
//! as an owned byte span, with the export namespace declared on the opening
//! tag so the record parses on its own.

use crate::config::{EXPORT_NAMESPACE, STREAM_BUFFER_CEILING, STREAM_CHUNK_SIZE};
use anyhow::{Context, Result};
use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use memchr::memmem::Finder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info, warn};

const PAGE_START: &[u8] = b"<page>";
const PAGE_END: &[u8] = b"</page>";

pub struct PageStream<R> {
    reader: R,
    buf: Vec<u8>,
    pos: usize,
    chunk_size: usize,
    ceiling: usize,
    eof: bool,
    dropped: u64,
    start: Finder<'static>,
    end: Finder<'static>,
    open_tag: Vec<u8>,
}

/// Opens a file for buffered reading, decompressing by extension (`.bz2`, `.gz`).
pub fn open_decompressed(path: impl AsRef<Path>) -> Result<Box<dyn BufRead + Send>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open: {:?}", path))?;
    Ok(decompress(path, file))
}

fn decompress(path: &Path, file: File) -> Box<dyn BufRead + Send> {
    let raw = BufReader::with_capacity(1024 * 1024, file);
    match path.extension().and_then(|e| e.to_str()) {
        Some("bz2") => Box::new(BufReader::with_capacity(256 * 1024, MultiBzDecoder::new(raw))),
        Some("gz") => Box::new(BufReader::with_capacity(256 * 1024, MultiGzDecoder::new(raw))),
        _ => Box::new(raw),
    }
}

impl PageStream<Box<dyn BufRead + Send>> {
    /// Opens a dump file, seeking the raw (compressed) handle to `offset` first.
    ///
    /// For `.bz2` dumps the offset must fall on a stream boundary of a
    /// multistream archive; no alignment is checked here. Resume correctness
    /// comes from the caller skipping page ids it has already flushed.
    pub fn open(path: impl AsRef<Path>, offset: u64) -> Result<Self> {
        let path = path.as_ref();
        let mut file =
            File::open(path).with_context(|| format!("Failed to open dump: {:?}", path))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .with_context(|| format!("Failed to seek dump to byte {}", offset))?;
            info!(offset, "Seeked dump before scanning");
        }
        Ok(Self::from_reader(decompress(path, file)))
    }
}

impl<R: Read> PageStream<R> {
    pub fn from_reader(reader: R) -> Self {
        let mut open_tag = b"<page xmlns=\"".to_vec();
        open_tag.extend_from_slice(EXPORT_NAMESPACE.as_bytes());
        open_tag.extend_from_slice(b"\">");
        Self {
            reader,
            buf: Vec::new(),
            pos: 0,
            chunk_size: STREAM_CHUNK_SIZE,
            ceiling: STREAM_BUFFER_CEILING,
            eof: false,
            dropped: 0,
            start: Finder::new(PAGE_START),
            end: Finder::new(PAGE_END),
            open_tag,
        }
    }

    pub fn with_limits(mut self, chunk_size: usize, ceiling: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.ceiling = ceiling.max(PAGE_START.len());
        self
    }

    /// Records abandoned because they outgrew the buffer ceiling.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn take_complete(&mut self) -> Option<Vec<u8>> {
        loop {
            let window = &self.buf[self.pos..];
            let start = self.start.find(window);
            let end = self.end.find(window);
            match (start, end) {
                (Some(s), Some(e)) if e > s => {
                    let stop = e + PAGE_END.len();
                    let span = self.normalize(&window[s..stop]);
                    self.pos += stop;
                    return Some(span);
                }
                (_, Some(e)) => {
                    // Tail of a record whose head was dropped at the ceiling.
                    debug!(bytes = e, "Discarding orphaned record tail");
                    self.pos += e + PAGE_END.len();
                }
                (Some(s), None) => {
                    self.pos += s;
                    return None;
                }
                (None, None) => {
                    let keep = PAGE_START.len() - 1;
                    self.pos += window.len().saturating_sub(keep);
                    return None;
                }
            }
        }
    }

    fn normalize(&self, span: &[u8]) -> Vec<u8> {
        let body = &span[PAGE_START.len()..];
        let mut out = Vec::with_capacity(self.open_tag.len() + body.len());
        out.extend_from_slice(&self.open_tag);
        out.extend_from_slice(body);
        out
    }

    fn fill(&mut self) -> Result<()> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }

        if self.buf.len() > self.ceiling {
            warn!(
                buffered = self.buf.len(),
                ceiling = self.ceiling,
                "Page record exceeded buffer ceiling, dropping it"
            );
            self.buf.clear();
            self.dropped += 1;
        }

        let read = (&mut self.reader)
            .take(self.chunk_size as u64)
            .read_to_end(&mut self.buf)
            .context("Failed to read from dump")?;
        if read == 0 {
            self.eof = true;
        }
        Ok(())
    }

    fn next_span(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(span) = self.take_complete() {
                return Ok(Some(span));
            }
            if self.eof {
                return Ok(None);
            }
            self.fill()?;
        }
    }
}

impl<R: Read> Iterator for PageStream<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_span() {
            Ok(Some(span)) => Some(Ok(span)),
            Ok(None) => None,
            Err(e) => {
                self.eof = true;
                self.buf.clear();
                self.pos = 0;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bzip2::write::BzEncoder;
    use bzip2::Compression;
    use std::io::{Cursor, Write};
    use tempfile::TempDir;

    fn page(id: u32) -> String {
        format!("<page><title>T{id}</title><ns>0</ns><id>{id}</id></page>")
    }

    fn collect<R: Read>(stream: PageStream<R>) -> Vec<String> {
        stream
            .map(|s| String::from_utf8(s.unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn yields_each_page_with_namespace() {
        let xml = format!("<mediawiki>\n{}\n{}\n</mediawiki>", page(1), page(2));
        let pages = collect(PageStream::from_reader(Cursor::new(xml)));
        assert_eq!(pages.len(), 2);
        assert!(pages[0].starts_with(&format!("<page xmlns=\"{}\">", EXPORT_NAMESPACE)));
        assert!(pages[0].contains("<id>1</id>"));
        assert!(pages[1].ends_with("</page>"));
    }

    #[test]
    fn markers_split_across_chunks() {
        let xml = format!("<mediawiki>{}{}{}</mediawiki>", page(1), page(2), page(3));
        let stream = PageStream::from_reader(Cursor::new(xml)).with_limits(5, 1024);
        let pages = collect(stream);
        assert_eq!(pages.len(), 3);
        assert!(pages[2].contains("<id>3</id>"));
    }

    #[test]
    fn oversized_record_is_dropped_and_scanning_recovers() {
        let huge = format!("<page><text>{}</text></page>", "x".repeat(500));
        let xml = format!("{}{}{}", page(1), huge, page(2));
        let mut stream = PageStream::from_reader(Cursor::new(xml)).with_limits(16, 128);
        let pages: Vec<_> = (&mut stream).map(|p| p.unwrap()).collect();
        assert_eq!(pages.len(), 2);
        assert!(String::from_utf8_lossy(&pages[1]).contains("<id>2</id>"));
        assert_eq!(stream.dropped(), 1);
    }

    #[test]
    fn empty_input_yields_nothing() {
        let pages = collect(PageStream::from_reader(Cursor::new(Vec::<u8>::new())));
        assert!(pages.is_empty());
    }

    #[test]
    fn unterminated_page_is_not_yielded() {
        let xml = format!("{}<page><title>cut", page(1));
        let pages = collect(PageStream::from_reader(Cursor::new(xml)));
        assert_eq!(pages.len(), 1);
    }

    fn bz2(data: &str) -> Vec<u8> {
        let mut enc = BzEncoder::new(Vec::new(), Compression::fast());
        enc.write_all(data.as_bytes()).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn open_bz2_multistream_with_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dump.xml.bz2");
        let first = bz2(&format!("<mediawiki>{}", page(1)));
        let second = bz2(&format!("{}{}</mediawiki>", page(2), page(3)));
        let mut file = File::create(&path).unwrap();
        file.write_all(&first).unwrap();
        file.write_all(&second).unwrap();
        drop(file);

        let all = collect(PageStream::open(&path, 0).unwrap());
        assert_eq!(all.len(), 3);

        let resumed = collect(PageStream::open(&path, first.len() as u64).unwrap());
        assert_eq!(resumed.len(), 2);
        assert!(resumed[0].contains("<id>2</id>"));
    }

    #[test]
    fn open_gzip_dump() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dump.xml.gz");
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        enc.write_all(format!("<mediawiki>{}{}</mediawiki>", page(7), page(8)).as_bytes())
            .unwrap();
        std::fs::write(&path, enc.finish().unwrap()).unwrap();

        let pages = collect(PageStream::open(&path, 0).unwrap());
        assert_eq!(pages.len(), 2);
    }

    #[test]
    fn open_missing_dump_fails() {
        assert!(PageStream::open("/nonexistent/dump.xml.bz2", 0).is_err());
    }
}
