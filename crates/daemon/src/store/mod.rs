// Document storage: the in-memory tree scanned from disk, the durable
// write primitive, and the debounced flush queue.

pub mod files;
pub mod flush;
pub mod tree;

pub use flush::{FlushConfig, FlushQueue};
pub use tree::{document_id_for_path, DocumentEntry, DocumentMeta, DocumentStore, SectionNode};
