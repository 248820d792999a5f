//! Compile-time JSX tagging.
//!
//! Annotates every native (lowercase-named) JSX element with a stable id
//! plus its file/line/column, and keeps an id -> location map that a
//! visual editor can query over HTTP to walk from a selected DOM node back
//! to the source that produced it.

pub mod id;
pub mod server;
pub mod source_map;
pub mod transform;

pub use id::{generate_stable_id, is_valid_jsx_id, parse_id, ParsedId};
pub use server::router;
pub use source_map::{JsxLocation, SourceMapManager};
pub use transform::{Tagger, TaggerOptions, TransformError};
