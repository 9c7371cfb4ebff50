//! Orchestrator tying discovery, fetch, delta resolution, and tree
//! materialization together per the clone/pull/repair flow.
//! `.gituprevision` stamping and CLI/exit-code plumbing live in `main.rs`;
//! this module owns the core run.

use std::fs;
use std::path::PathBuf;

use log::info;

use crate::cli::Cli;
use crate::config::Config;
use crate::delta;
use crate::error::{GitupError, Result};
use crate::hash::ObjectHash;
use crate::manifest::Manifest;
use crate::pack;
use crate::protocol::{Client, FetchKind, WantSelection};
use crate::repair;
use crate::scanner::Scanner;
use crate::store::ObjectStore;
use crate::tree::{self, Display};

pub const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/gitup.conf";

/// What changed this run, for `.gituprevision` stamping and the "please
/// rerun" notice (main.rs prints these; session.rs only reports facts).
pub struct RunReport {
    pub want: ObjectHash,
    pub want_display: String,
    pub updated: bool,
    pub repair_ran: bool,
    pub updating_notices: Vec<PathBuf>,
    pub target_directory: PathBuf,
}

pub fn run(cli: &Cli) -> Result<RunReport> {
    let config_path = cli.config_path.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let cfg = Config::load(&config_path, &cli.section)?;
    let low_memory = cli.low_memory || cfg.low_memory;

    fs::create_dir_all(&cfg.work_directory).map_err(|e| GitupError::io(&cfg.work_directory, e))?;
    let manifest_path = cfg.manifest_path();
    let prior_manifest = Manifest::load(&manifest_path)?;

    let dir_modes = prior_manifest.as_ref().map(|m| m.dir_modes(&cfg.target_directory)).unwrap_or_default();
    let scanner = Scanner::new(&cfg.target_directory, &cfg.ignores, &dir_modes);
    let mut local = scanner.scan()?;

    let force_clone = cli.force_clone || prior_manifest.is_none();

    let (pack_bytes, want_hash, want_display, repair_ran, targeted_defects) = if let Some(local_pack_path) = &cli.local_pack {
        let want_hex = cli
            .want
            .as_deref()
            .ok_or_else(|| GitupError::ConfigInvalid("-u requires -w to name the commit the pack resolves to".into()))?;
        let bytes = fs::read(local_pack_path).map_err(|e| GitupError::io(local_pack_path, e))?;
        (Some(bytes), ObjectHash::from_hex(want_hex)?, "(detached)".to_string(), false, None)
    } else {
        let mut client = Client::connect(&cfg.host, cfg.port, &cfg.repository_path, cfg.proxy.as_ref(), cli.verbosity > 0)?;
        client.discover()?;
        let refs = client.ls_refs()?;

        let selection = if let Some(hash) = &cli.want {
            WantSelection::Explicit(hash)
        } else if let Some(tag) = &cli.tag {
            WantSelection::Tag(tag)
        } else {
            WantSelection::Branch(&cfg.branch)
        };
        let (want_hex, want_display) = Client::resolve_want(&refs, selection)?;
        let want_hash = ObjectHash::from_hex(&want_hex)?;

        let have_hash = cli
            .have
            .as_deref()
            .map(ObjectHash::from_hex)
            .transpose()?
            .or_else(|| if force_clone { None } else { prior_manifest.as_ref().map(|m| m.have) });

        if cli.force_repair {
            let defects = match &prior_manifest {
                Some(m) => repair::plan(m, &local, &cfg.target_directory, &cfg.ignores),
                None => Vec::new(),
            };
            if defects.is_empty() {
                info!("repair requested but no defects found; nothing to do");
                (None, want_hash, want_display, true, None)
            } else {
                let wants: Vec<String> = defects.iter().map(|d| d.want.to_hex()).collect();
                let bytes = client.fetch(FetchKind::Repair { wants: &wants })?;
                (Some(bytes), want_hash, want_display, true, Some(defects))
            }
        } else if force_clone {
            let bytes = client.fetch(FetchKind::Clone { want: &want_hex })?;
            (Some(bytes), want_hash, want_display, false, None)
        } else if Some(want_hash) == have_hash {
            info!("already at {want_hex}; nothing to do");
            (None, want_hash, want_display, false, None)
        } else {
            let have_hex = have_hash.map(|h| h.to_hex()).unwrap_or_else(|| want_hex.clone());
            let bytes = client.fetch(FetchKind::Pull { want: &want_hex, have: &have_hex })?;
            (Some(bytes), want_hash, want_display, false, None)
        }
    };

    if let (Some(bytes), true) = (&pack_bytes, cli.keep_pack) {
        let pack_path = cfg.work_directory.join(format!("{}-{}.pack", cfg.section, want_hash.to_hex()));
        fs::write(&pack_path, bytes).map_err(|e| GitupError::io(&pack_path, e))?;
    }

    let scratch_path = manifest_path.with_extension("tmp");
    let mut store = ObjectStore::new(low_memory, low_memory.then_some(scratch_path.as_path()))?;
    store.repair = cli.force_repair;

    if let Some(manifest) = &prior_manifest {
        manifest.synthesize_tree_objects(&mut store)?;
    }

    let Some(bytes) = pack_bytes else {
        return Ok(RunReport {
            want: want_hash,
            want_display,
            updated: false,
            repair_ran,
            updating_notices: Vec::new(),
            target_directory: cfg.target_directory.clone(),
        });
    };

    let summary = pack::read_pack(&bytes, &mut store)?;
    delta::resolve_all(&mut store, &summary, |hash| local.find_blob_bytes(Some(hash), None))?;

    if summary.object_count == 0 {
        return Ok(RunReport {
            want: want_hash,
            want_display,
            updated: false,
            repair_ran,
            updating_notices: Vec::new(),
            target_directory: cfg.target_directory.clone(),
        });
    }

    let outcome = if let Some(defects) = &targeted_defects {
        // a targeted repair fetch returns only the defective blobs, never the
        // commit or trees, so the target state comes from the prior manifest
        // plus the defect list rather than a fresh walk.
        let manifest = prior_manifest.clone().expect("targeted repair defects require a prior manifest");
        tree::outcome_from_defects(manifest, &cfg.target_directory, defects)
    } else {
        tree::walk(&mut store, &mut local, &cfg.target_directory, want_hash)?
    };
    let mut display = Display::new(&cfg.target_directory, cli.verbosity, cli.display_depth);

    let updating_notices = if cli.force_repair {
        tree::materialize_repair(&mut store, &outcome.remote_by_path, &mut local, &mut display)?;
        Vec::new()
    } else {
        tree::materialize_writes(&mut store, &outcome.remote_by_path, &mut display)?
    };
    tree::prune(&local, &cfg.target_directory, &cfg.ignores, &mut display)?;

    outcome.manifest.write_atomic(&manifest_path)?;

    Ok(RunReport {
        want: want_hash,
        want_display,
        updated: !outcome.remote_by_path.is_empty(),
        repair_ran,
        updating_notices,
        target_directory: cfg.target_directory.clone(),
    })
}
