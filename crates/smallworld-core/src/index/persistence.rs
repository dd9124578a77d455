//! Shared bincode save/load helpers for the index façades.
//!
//! Both façades persist their link structure with the same discipline:
//! one bincode file per graph, written through a buffered writer. The
//! storage itself is not persisted; callers re-supply it on load.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// File name of the persisted HNSW link structure.
pub(crate) const HNSW_GRAPH_FILE: &str = "hnsw_graph.bin";
/// File name of the persisted NSG link structure.
pub(crate) const NSG_GRAPH_FILE: &str = "nsg_graph.bin";

pub(crate) fn save_bincode<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let writer = std::io::BufWriter::new(file);
    bincode::serialize_into(writer, value).map_err(|e| Error::Serialization(e.to_string()))
}

pub(crate) fn load_bincode<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    bincode::deserialize_from(reader).map_err(|e| Error::Serialization(e.to_string()))
}
