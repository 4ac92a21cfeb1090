//! # context-weave
//!
//! A context-retrieval engine for developer tools: given a query and the
//! caller's working context (active file, branch, open tickets), it returns
//! ranked code and document fragments from a local index, federated with
//! live results from git history, issue trackers, and chat.
//!
//! ## Architecture
//!
//! ```text
//!  ┌────────────┐   ┌──────────────────────┐   ┌──────────────┐
//!  │ index roots│──▶│ digest ─ chunk ─     │──▶│    SQLite    │
//!  │  (files)   │   │ enrich ─ embed       │   │ FTS5 + vecs  │
//!  └────────────┘   └──────────────────────┘   └──────┬───────┘
//!                                                     │
//!  ┌────────────┐        ┌────────────────────────────┤
//!  │ connectors │        ▼                            ▼
//!  │ git/http   │──▶ QueryService: retrieve ─ federate ─ rerank
//!  └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cw init                                   # create database
//! cw index                                  # index every configured root
//! cw search "token refresh" --active-file src/auth.rs
//! cw embed pending                          # backfill vectors after an outage
//! cw watch                                  # re-index on file changes
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | `ChunkStore` over SQLite (FTS5 + vector BLOBs) |
//! | [`scan`] | Root walking, glob filtering, content hashing |
//! | [`indexer`] | Incremental indexing passes |
//! | [`jobs`] | Background index jobs and status |
//! | [`watch`] | File-watch and periodic re-index scheduling |
//! | [`embed_cmd`] | Pending-embedding backfill |
//! | [`embedding`] | OpenAI / Ollama / disabled embedding providers |
//! | [`reranker`] | HTTP / disabled rerankers |
//! | [`context`] | Session-scoped work context |
//! | [`retriever`] | Hybrid keyword + vector candidate retrieval |
//! | [`connectors`] | External live-query sources |
//! | [`health`] | Per-source backoff |
//! | [`service`] | The search entry point |
//! | [`engine`] | Wiring from config |
//! | [`commands`] | `cw` subcommands |

pub mod commands;
pub mod config;
pub mod connectors;
pub mod context;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod engine;
pub mod health;
pub mod indexer;
pub mod jobs;
pub mod migrate;
pub mod reranker;
pub mod retriever;
pub mod scan;
pub mod service;
pub mod sqlite_store;
pub mod watch;
