use crate::models::Fields;
use log::debug;
use serde_json::Value;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use uuid::Uuid;
use zip::result::ZipError;
use zip::ZipArchive;

/// Multipart field name whose uploads are archives to unpack.
pub const EXTRACT_KEY: &str = "extract";

/// One uploaded part as received from the client.
#[derive(Clone, Debug)]
pub struct Upload {
    pub key: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub content: Vec<u8>,
}

impl Upload {
    pub fn is_archive(&self) -> bool {
        self.key == EXTRACT_KEY
    }
}

/// An archive member read out of an upload.
#[derive(Debug)]
pub struct Member {
    pub name: String,
    pub content: Result<Vec<u8>, ZipError>,
}

/// Blob storage for file contents, one file per resource id under `root`.
#[derive(Clone, Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FileStorage { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Writes the content and returns the fields describing it.
    pub fn save(
        &self,
        id: Uuid,
        key: &str,
        name: &str,
        content_type: Option<&str>,
        content: &[u8],
    ) -> io::Result<Fields> {
        let path = self.path_for(id);
        fs::write(&path, content)?;
        debug!("Stored {} bytes at {}", content.len(), path.display());

        let mut fields = Fields::new();
        fields.insert("key".into(), Value::from(key));
        fields.insert("name".into(), Value::from(name));
        fields.insert(
            "type".into(),
            Value::from(content_type.unwrap_or("application/octet-stream")),
        );
        fields.insert("path".into(), Value::from(path.to_string_lossy().into_owned()));
        fields.insert("size".into(), Value::from(content.len() as u64));
        Ok(fields)
    }

    pub fn read(&self, id: Uuid) -> io::Result<Vec<u8>> {
        fs::read(self.path_for(id))
    }

    pub fn remove(&self, id: Uuid) -> io::Result<()> {
        match fs::remove_file(self.path_for(id)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            result => result,
        }
    }
}

/// Reads every non-directory member of a zip archive.
///
/// Failing to open the archive fails the whole call; a member that can't be
/// read is returned with its error so the others still go through.
pub fn extract_members(archive: &[u8]) -> Result<Vec<Member>, ZipError> {
    let mut zip = ZipArchive::new(Cursor::new(archive))?;
    let mut members = Vec::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let mut content = Vec::new();
        let content = match entry.read_to_end(&mut content) {
            Ok(_) => Ok(content),
            Err(e) => Err(ZipError::Io(e)),
        };
        members.push(Member { name, content });
    }
    Ok(members)
}
