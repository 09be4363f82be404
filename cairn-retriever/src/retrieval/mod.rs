pub mod catalog;
pub mod directory_watcher;
pub mod index_manager;
pub mod indexer_state;
pub mod metadata;
pub mod scanner;
pub mod update_queue;
pub mod vector_index;
