// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Daemon lifecycle management

pub mod launch_daemon;

pub use launch_daemon::Daemon;
