pub mod accumulator;
pub mod api;
pub mod config;
pub mod consumer;
pub mod dataset;
pub mod error;
pub mod event;
pub mod extract;
pub mod handler;
pub mod identity;
pub mod mock;
pub mod producer;
pub mod reporter;
pub mod retriever;
pub mod retry;
pub mod storage;
pub mod vault;
