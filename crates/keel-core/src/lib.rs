//! keel-core
//!
//! Core building blocks for the Keel scheduler gate.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, keys, node, lease, task, state, command, errors, events）
//! - **ports**: 抽象化レイヤー（CoordinationService, WorkerChannel, DispatchStrategy, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（builder, registry, task_store, session, reassign, patrol_loop, など）
//! - **impls**: 実装（InMemoryCoordination, LeastLoadedDispatch）
//! - **config**: GateConfig と起動時検証

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use config::{GateConfig, PatrolConfig};
pub use domain::{GateError, Result};
