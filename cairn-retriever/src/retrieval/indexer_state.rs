use serde::{Deserialize, Serialize};

/// Lifecycle state of the indexing manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexerState {
    /// Nothing has happened yet
    #[default]
    Uninitialized,

    /// Waiting for the embedding provider to come up
    LoadingModel,

    /// A compatible index was read from disk and is being checked
    IndexLoaded,

    /// First full build, searches see an empty index
    BuildingIndex,

    /// Searchable and idle
    Ready,

    /// Full rebuild while the previous index keeps serving searches
    Reindexing,

    /// Applying a batch of incremental updates
    Updating,

    /// No provider, or indexing switched off. Searches return nothing.
    Disabled,
}

impl IndexerState {
    /// Whether searches are answered in this state. During the first build the
    /// index is empty but queryable.
    pub fn is_searchable(&self) -> bool {
        !matches!(
            self,
            IndexerState::Uninitialized | IndexerState::LoadingModel | IndexerState::Disabled
        )
    }

    /// Whether a build or update is running
    pub fn is_indexing(&self) -> bool {
        matches!(
            self,
            IndexerState::BuildingIndex | IndexerState::Reindexing | IndexerState::Updating
        )
    }

    /// Whether initialization has finished, successfully or not
    pub fn is_initialized(&self) -> bool {
        !matches!(self, IndexerState::Uninitialized | IndexerState::LoadingModel)
    }
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexerState::Uninitialized => write!(f, "uninitialized"),
            IndexerState::LoadingModel => write!(f, "loading-model"),
            IndexerState::IndexLoaded => write!(f, "index-loaded"),
            IndexerState::BuildingIndex => write!(f, "building-index"),
            IndexerState::Ready => write!(f, "ready"),
            IndexerState::Reindexing => write!(f, "reindexing"),
            IndexerState::Updating => write!(f, "updating"),
            IndexerState::Disabled => write!(f, "disabled"),
        }
    }
}

impl std::str::FromStr for IndexerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "uninitialized" => Ok(IndexerState::Uninitialized),
            "loading-model" | "loading" => Ok(IndexerState::LoadingModel),
            "index-loaded" | "loaded" => Ok(IndexerState::IndexLoaded),
            "building-index" | "building" => Ok(IndexerState::BuildingIndex),
            "ready" => Ok(IndexerState::Ready),
            "reindexing" => Ok(IndexerState::Reindexing),
            "updating" => Ok(IndexerState::Updating),
            "disabled" => Ok(IndexerState::Disabled),
            _ => Err(format!(
                "Invalid indexer state: '{s}'. Valid values are: uninitialized, loading-model, index-loaded, building-index, ready, reindexing, updating, disabled"
            )),
        }
    }
}
