// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Key Backup Storage
//!
//! Persistent state is a small transactional key-value store split into two
//! named collections:
//!
//! ```text
//! keys/
//!   masterKey                   # 32 raw bytes
//!   pinType                     # 1 byte (1 = numeric, 2 = alphanumeric)
//!   encodedVerificationString   # Argon2i PHC string
//!   isMasterKeyBackedUp         # bool
//!   hasBackupKeyRequestFailed   # bool
//!   hasPendingRestoration       # bool
//!   enclaveName                 # enclave that holds the escrowed key
//!   Storage Service Encryption  # synced derived key (linked devices)
//! token/
//!   {enclave}.backupId          # 32 bytes
//!   {enclave}.data              # 32 bytes
//!   {enclave}.tries             # u32
//!   {enclave}.enclaveName       # enclave that issued the token
//! ```
//!
//! - `kv` defines the store trait, write batches and an in-memory store
//! - `database` is the durable redb implementation

pub mod database;
pub mod kv;

pub use database::Database;
pub use kv::{Collection, KeyValueStore, MemoryStore, StoreError, StoreResult, WriteBatch};
