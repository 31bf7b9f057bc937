// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Writable Python environments on top of komodo.
//!
//! Komodo is a shared, read-only distribution of Python and scientific
//! software living under a common root directory. Komodoenv builds small
//! per-user environments that layer on top of a komodo release, and keep
//! following a moving track of releases through an update protocol.
//!
//! # Flow
//!
//! 1. [`release::resolve`] turns a user supplied release name into a
//!    concrete release plus the track to follow.
//! 2. [`environment`] materializes a komodoenv from that release.
//! 3. [`update`] relinks the komodoenv whenever its track moves upstream.

pub mod config;
pub mod environment;
pub mod file;
pub mod path;
pub mod platform;
pub mod process;
pub mod release;
pub mod scripts;
pub mod update;
