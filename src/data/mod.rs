//! Persistence of intensity arrays.

pub mod storage;

pub use storage::{store_for, ArrayFile, ArrayStore, BincodeArrayStore, CsvArrayStore, StorageFormat};
