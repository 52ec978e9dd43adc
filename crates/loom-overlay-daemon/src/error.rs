// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
	#[error("engine error: {0}")]
	Engine(#[from] loom_overlay_engine::EngineError),

	#[error("identity error: {0}")]
	Identity(#[from] loom_overlay_common::KeyFileError),

	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("missing required environment variable: {0}")]
	MissingEnvVar(String),

	#[error("invalid value for {name}: {message}")]
	InvalidValue { name: String, message: String },
}

pub type Result<T> = std::result::Result<T, DaemonError>;
