use super::FileNode;
use flate2::{Compression, write::GzEncoder};
use std::io::{self, Read, Write};
use tar::{Builder, EntryType, Header};

/// Tar header carrying the metadata of a file restic backed up from stdin.
/// The path is left to the builder so names longer than the header field get a long-name entry.
pub fn file_header(node: &FileNode) -> Header {
    let seconds = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.timestamp().max(0) as u64).unwrap_or_default()
    };

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(node.size);
    header.set_mode(node.mode & 0o7777);
    header.set_uid(node.uid.into());
    header.set_gid(node.gid.into());
    header.set_mtime(seconds(node.mtime));
    if let Some(gnu) = header.as_gnu_mut() {
        gnu.set_atime(seconds(node.atime));
        gnu.set_ctime(seconds(node.ctime));
    }
    header
}

/// Gzips everything `source` yields into `sink`.
///
/// With an `entry` the data is first wrapped into a single-entry tar archive described by it,
/// and `source` has to yield exactly the recorded size. The tar stream is finished before the
/// gzip trailer is written, `sink` is handed back unflushed.
pub fn compress<R, W>(mut source: R, sink: W, entry: Option<&FileNode>) -> io::Result<W>
where
    R: Read,
    W: Write,
{
    let mut encoder = GzEncoder::new(sink, Compression::default());

    let Some(node) = entry else {
        io::copy(&mut source, &mut encoder)?;
        return encoder.finish();
    };

    let mut header = file_header(node);
    let path = node.path.strip_prefix('/').unwrap_or(&node.path);
    let mut builder = Builder::new(encoder);
    let mut data = source.take(node.size);
    builder.append_data(&mut header, path, &mut data)?;
    if data.limit() != 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{} ended {} bytes early", node.path, data.limit()),
        ));
    }
    let mut rest = data.into_inner();
    if rest.read(&mut [0u8; 1])? != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is larger than its recorded size", node.path),
        ));
    }

    let encoder = builder.into_inner()?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use flate2::read::GzDecoder;

    fn node(size: u64) -> FileNode {
        named("ns-postgres.sql", size)
    }

    fn named(name: &str, size: u64) -> FileNode {
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 9, 59, 0).unwrap();
        FileNode {
            name: name.to_string(),
            kind: "file".to_string(),
            path: format!("/{name}"),
            uid: 999,
            gid: 998,
            size,
            mode: 0o640,
            mtime: Some(time),
            atime: Some(time),
            ctime: Some(time),
        }
    }

    #[test]
    fn test_single_entry_round_trip() {
        let content = b"SELECT 1;\n".repeat(100);
        let node = node(content.len() as u64);
        let gz = compress(content.as_slice(), Vec::new(), Some(&node)).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(gz.as_slice()));
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        let header = entry.header();
        assert_eq!(entry.path().unwrap().to_str(), Some("ns-postgres.sql"));
        assert_eq!(header.size().unwrap(), content.len() as u64);
        assert_eq!(header.mode().unwrap(), 0o640);
        assert_eq!(header.uid().unwrap(), 999);
        assert_eq!(header.gid().unwrap(), 998);
        assert_eq!(
            header.mtime().unwrap(),
            node.mtime.unwrap().timestamp() as u64
        );

        let mut restored = Vec::new();
        entry.read_to_end(&mut restored).unwrap();
        assert_eq!(restored, content);
        drop(entry);
        assert!(entries.next().is_none());
    }

    #[test]
    fn test_long_file_name() {
        // namespace and container names may each take 63 characters
        let name = format!("{}-{}.sql", "n".repeat(63), "c".repeat(63));
        assert!(name.len() > 100);
        let node = named(&name, 4);
        let gz = compress(&b"data"[..], Vec::new(), Some(&node)).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(gz.as_slice()));
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some(name.as_str()));
        assert_eq!(entry.header().uid().unwrap(), 999);
        let mut restored = String::new();
        entry.read_to_string(&mut restored).unwrap();
        assert_eq!(restored, "data");
    }

    #[test]
    fn test_passthrough() {
        let gz = compress(&b"already a tar stream"[..], Vec::new(), None).unwrap();
        let mut plain = String::new();
        GzDecoder::new(gz.as_slice())
            .read_to_string(&mut plain)
            .unwrap();
        assert_eq!(plain, "already a tar stream");
    }

    #[test]
    fn test_size_mismatch() {
        let short = compress(&b"abc"[..], Vec::new(), Some(&node(10))).unwrap_err();
        assert_eq!(short.kind(), io::ErrorKind::UnexpectedEof);

        let long = compress(&b"abcdef"[..], Vec::new(), Some(&node(3))).unwrap_err();
        assert_eq!(long.kind(), io::ErrorKind::InvalidData);
    }
}
