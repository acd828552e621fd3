// In-memory representation of the Markdown file tree.
//
// The tree is scanned once at startup: directories become sections,
// `.md` files become documents (content loaded into memory), everything
// else becomes a resource. The in-memory content is the authoritative copy
// while the daemon runs; the sync engine mutates it through the scoped
// borrows below and flushes it back to disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use vellum_common::types::DocumentId;

const MARKDOWN_EXTENSION: &str = "md";
/// Length of the hex id derived from a relative path.
const ID_HEX_LEN: usize = 16;

/// Stable id for the node at `rel_path` (empty string for the root).
///
/// Deterministic across restarts so clients can persist document ids.
pub fn document_id_for_path(rel_path: &str) -> DocumentId {
    let digest = Sha256::digest(rel_path.as_bytes());
    let mut id = String::with_capacity(ID_HEX_LEN);
    for byte in digest.iter().take(ID_HEX_LEN / 2) {
        id.push_str(&format!("{byte:02x}"));
    }
    DocumentId::new(id)
}

/// Metadata of a document in the tree.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DocumentMeta {
    pub id: DocumentId,
    pub name: String,
    /// Path relative to the docs root, with `/` separators.
    pub rel_path: String,
    /// Absolute path on disk.
    #[serde(skip)]
    pub path: PathBuf,
    pub filesize: u64,
    pub mod_time: DateTime<Utc>,
}

/// A document plus its live content.
#[derive(Debug, Clone)]
pub struct DocumentEntry {
    pub meta: DocumentMeta,
    pub content: String,
}

/// Metadata of a non-Markdown file in the tree.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResourceMeta {
    pub id: DocumentId,
    pub name: String,
    pub rel_path: String,
    pub filesize: u64,
}

/// A directory in the tree.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SectionNode {
    pub id: DocumentId,
    pub name: String,
    pub subsections: Vec<SectionNode>,
    pub documents: Vec<DocumentId>,
    pub resources: Vec<ResourceMeta>,
}

struct TreeInner {
    root: SectionNode,
    documents: HashMap<DocumentId, DocumentEntry>,
}

/// The scanned document tree with lookup by id.
pub struct DocumentStore {
    docs_root: PathBuf,
    inner: RwLock<TreeInner>,
}

impl DocumentStore {
    /// Scan `docs_root` recursively and load every Markdown file.
    pub fn scan(docs_root: &Path, ignore: &[String]) -> Result<Self> {
        let mut documents = HashMap::new();
        let root = scan_section(docs_root, docs_root, "root", ignore, &mut documents)
            .with_context(|| format!("failed to scan docs root {}", docs_root.display()))?;
        debug!(documents = documents.len(), root = %docs_root.display(), "document tree scanned");

        Ok(Self {
            docs_root: docs_root.to_path_buf(),
            inner: RwLock::new(TreeInner { root, documents }),
        })
    }

    pub fn docs_root(&self) -> &Path {
        &self.docs_root
    }

    pub fn contains_document(&self, id: &DocumentId) -> bool {
        self.read().documents.contains_key(id)
    }

    pub fn document_count(&self) -> usize {
        self.read().documents.len()
    }

    /// Current content of a document, copied out under the read borrow.
    pub fn content(&self, id: &DocumentId) -> Option<String> {
        self.read().documents.get(id).map(|entry| entry.content.clone())
    }

    pub fn meta(&self, id: &DocumentId) -> Option<DocumentMeta> {
        self.read().documents.get(id).map(|entry| entry.meta.clone())
    }

    /// Run `f` against the document under the tree's read borrow.
    pub fn with_document<R>(&self, id: &DocumentId, f: impl FnOnce(&DocumentEntry) -> R) -> Option<R> {
        self.read().documents.get(id).map(f)
    }

    /// Replace a document's content. Returns false for an unknown id.
    pub fn set_content(&self, id: &DocumentId, content: String) -> bool {
        let mut inner = self.write();
        match inner.documents.get_mut(id) {
            Some(entry) => {
                entry.content = content;
                true
            }
            None => false,
        }
    }

    /// A clone of the section tree (for listings).
    pub fn tree(&self) -> SectionNode {
        self.read().root.clone()
    }

    /// Every document id under the section with `section_id`, recursively.
    ///
    /// Returns `None` when no such section exists.
    pub fn document_ids_under(&self, section_id: &DocumentId) -> Option<Vec<DocumentId>> {
        let inner = self.read();
        let section = find_section(&inner.root, section_id)?;
        let mut ids = Vec::new();
        collect_document_ids(section, &mut ids);
        Some(ids)
    }

    /// Convenience lookup used by tests and tooling.
    pub fn document_id_by_rel_path(&self, rel_path: &str) -> Option<DocumentId> {
        let id = document_id_for_path(rel_path);
        self.contains_document(&id).then_some(id)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TreeInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TreeInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn scan_section(
    docs_root: &Path,
    dir: &Path,
    name: &str,
    ignore: &[String],
    documents: &mut HashMap<DocumentId, DocumentEntry>,
) -> Result<SectionNode> {
    let rel_dir = rel_path_of(docs_root, dir);
    let mut section = SectionNode {
        id: document_id_for_path(&rel_dir),
        name: name.to_owned(),
        subsections: Vec::new(),
        documents: Vec::new(),
        resources: Vec::new(),
    };

    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("failed to list directory {}", dir.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.starts_with('.') {
            continue;
        }
        let rel = rel_path_of(docs_root, &path);
        if is_ignored(&rel, ignore) {
            continue;
        }

        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat directory entry {}", path.display()))?;
        if file_type.is_dir() {
            let subsection = scan_section(docs_root, &path, &file_name, ignore, documents)?;
            section.subsections.push(subsection);
        } else if path.extension().and_then(|e| e.to_str()) == Some(MARKDOWN_EXTENSION) {
            match load_document(&path, &rel, &file_name) {
                Ok(entry) => {
                    section.documents.push(entry.meta.id.clone());
                    documents.insert(entry.meta.id.clone(), entry);
                }
                Err(error) => {
                    warn!(path = %path.display(), ?error, "skipping unreadable document");
                }
            }
        } else {
            let metadata = entry
                .metadata()
                .with_context(|| format!("failed to stat resource {}", path.display()))?;
            section.resources.push(ResourceMeta {
                id: document_id_for_path(&rel),
                name: file_name,
                rel_path: rel,
                filesize: metadata.len(),
            });
        }
    }

    Ok(section)
}

fn load_document(path: &Path, rel_path: &str, file_name: &str) -> Result<DocumentEntry> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read document {}", path.display()))?;
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("failed to stat document {}", path.display()))?;
    let mod_time: DateTime<Utc> = metadata.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());

    let name = file_name.strip_suffix(".md").unwrap_or(file_name).to_owned();
    Ok(DocumentEntry {
        meta: DocumentMeta {
            id: document_id_for_path(rel_path),
            name,
            rel_path: rel_path.to_owned(),
            path: path.to_path_buf(),
            filesize: metadata.len(),
            mod_time,
        },
        content,
    })
}

fn rel_path_of(docs_root: &Path, path: &Path) -> String {
    path.strip_prefix(docs_root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_ignored(rel_path: &str, ignore: &[String]) -> bool {
    ignore.iter().any(|entry| {
        rel_path == entry || rel_path.starts_with(&format!("{entry}/"))
    })
}

fn find_section<'a>(node: &'a SectionNode, id: &DocumentId) -> Option<&'a SectionNode> {
    if &node.id == id {
        return Some(node);
    }
    node.subsections.iter().find_map(|sub| find_section(sub, id))
}

fn collect_document_ids(node: &SectionNode, out: &mut Vec<DocumentId>) {
    out.extend(node.documents.iter().cloned());
    for sub in &node.subsections {
        collect_document_ids(sub, out);
    }
}
