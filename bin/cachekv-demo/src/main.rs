//! Wires a [`cachekv_engine::cachefs::local::LocalCacheFs`] and an
//! in-memory mock backend together behind a [`cachekv_engine::EngineConfig`]
//! and drives one put/release/checkpoint cycle end to end, printing the
//! resulting stats. Useful as a smoke test and as executable documentation
//! of the engine's call sequence.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use cachekv_engine::backend::mock::MockBlockStore;
use cachekv_engine::cachefs::local::LocalCacheFs;
use cachekv_engine::codec::ZstdCodec;
use cachekv_engine::config::{CodecId, EngineConfig};
use cachekv_engine::flags::GetFlags;
use cachekv_engine::key::{BitmapHint, Key};
use cachekv_engine::runtime::EngineRuntime;

/// Exercise a cachekv-engine checkpoint cycle against a scratch directory.
#[derive(Parser, Debug)]
struct Args {
    /// Directory to use for cache state. A fresh tempdir is used if omitted.
    #[arg(long)]
    cache_dir: Option<std::path::PathBuf>,

    /// Number of key/value pairs to put before checkpointing.
    #[arg(long, default_value_t = 8)]
    items: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut _tempdir_guard = None;
    let cache_dir = match args.cache_dir {
        Some(dir) => dir,
        None => {
            let dir = tempfile::tempdir()?;
            let path = dir.path().to_path_buf();
            _tempdir_guard = Some(dir);
            path
        }
    };

    info!(?cache_dir, items = args.items, "starting cachekv-demo");

    let backend = Arc::new(MockBlockStore::new());
    let fs = Arc::new(LocalCacheFs::new(cache_dir));
    let codec = Arc::new(ZstdCodec::new(CodecId::Zstd3));
    let config = EngineConfig::default();

    let runtime = EngineRuntime::start(backend, fs, codec, config)?;
    let engine = Arc::clone(&runtime.engine);

    for i in 0..args.items {
        let key = Key::from(format!("demo-key-{i}").into_bytes());
        let payload = format!("payload for item {i}").into_bytes();

        let mut handle = engine.get(
            &key,
            true,
            GetFlags::new(),
            BitmapHint::Unknown,
            Some(payload.len() as u64),
            None,
        )?;
        handle.write_all(&payload)?;
        engine.release(handle)?;
    }

    let stats_before = engine.stats();
    info!(?stats_before, "stats before checkpoint");

    let committed = engine.checkpoint(true, 3);
    info!(committed, "checkpoint result");

    let stats_after = engine.stats();
    info!(?stats_after, "stats after checkpoint");

    for i in 0..args.items {
        let key = Key::from(format!("demo-key-{i}").into_bytes());
        let mut handle = engine.get(
            &key,
            false,
            GetFlags::new().with_read_only(),
            BitmapHint::Unknown,
            None,
            None,
        )?;
        let data = handle.read_all()?;
        engine.release(handle)?;
        info!(i, bytes = data.len(), "read back item");
    }

    runtime.stop();
    Ok(())
}
