//! Storage layer: catalogs, write and read pipelines, and the store handle.

pub(crate) mod catalog;
pub mod checksum;
pub mod file_model;
pub mod read_pipeline;
pub mod storage_service;
pub mod write_pipeline;

#[cfg(test)]
pub(crate) mod test_support;
