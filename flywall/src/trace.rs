// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Tracing bring-up: level from `FLYWALL_LOG_LEVEL`, optional file sink
//! from `FLYWALL_LOG_FILE`, and a reload handle kept around so a future
//! control surface can retune levels at runtime.

use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{reload, EnvFilter, Registry, prelude::*};

pub struct TracingControl {
    #[allow(dead_code)] // held for runtime level changes
    reload_handle: reload::Handle<EnvFilter, Registry>,
}

fn base_filter() -> EnvFilter {
    let level = std::env::var("FLYWALL_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let directives = format!("{level},hyper=warn,h2=warn,sled=warn,rustls=warn");
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string()))
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init() -> std::io::Result<TracingControl> {
    let (filter, reload_handle) = reload::Layer::new(base_filter());

    match std::env::var("FLYWALL_LOG_FILE") {
        Ok(path) if !path.is_empty() => {
            let file = Arc::new(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)?,
            );
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(file);
            Registry::default().with(filter).with(fmt_layer).init();
        }
        _ => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_names(true);
            Registry::default().with(filter).with(fmt_layer).init();
        }
    }
    Ok(TracingControl { reload_handle })
}
