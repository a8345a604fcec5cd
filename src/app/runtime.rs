//! Controller runtime: store construction, background workers, and the
//! shutdown loop.
//!
//! The runtime wires the catalog store, extension store, content store,
//! release engine, watcher, and work queue together, spawns the catalog
//! refresh task and the reconcile workers, and runs until interrupted.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::apply::preflight::CrdUpgradeSafety;
use crate::apply::release::FileReleaseStore;
use crate::apply::Applier;
use crate::catalog;
use crate::cluster::{ExtensionStore, InProcessCluster};
use crate::config::Settings;
use crate::events::{self, CatalogEvent, CatalogEventKind};
use crate::reconcile::Reconciler;
use crate::resolve::Resolver;
use crate::sources;
use crate::unpack::ContentStoreUnpacker;
use crate::util;
use crate::watch::DynamicWatcher;

use super::queue::WorkQueue;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// File name of the on-disk catalog snapshot inside the state directory.
const CATALOG_SNAPSHOT: &str = "catalogs.json";

/// Concrete reconciler type the runtime drives.
type RuntimeReconciler =
    Reconciler<Arc<catalog::Store>, Arc<ContentStoreUnpacker>, Arc<InProcessCluster>>;

/// What: Run the controller end-to-end: build stores, spawn background
/// workers (catalog refresh, event forwarders, reconcile workers), and
/// block until interrupted.
///
/// Inputs:
/// - `settings`: Loaded controller settings.
///
/// Output:
/// - `Ok(())` on clean shutdown.
pub async fn run(settings: Settings) -> Result<()> {
    tracing::info!(
        workers = settings.workers,
        state_dir = %settings.state_dir.display(),
        content_dir = %settings.content_dir.display(),
        catalogs = settings.catalogs.len(),
        "starting controller"
    );

    let cluster = Arc::new(InProcessCluster::new());
    let extensions = Arc::new(ExtensionStore::new());
    let catalogs = Arc::new(catalog::Store::new());
    catalogs.load_from_disk(&settings.state_dir.join(CATALOG_SNAPSHOT));

    let (pull_tx, mut pull_rx) = mpsc::unbounded_channel();
    let unpacker = Arc::new(ContentStoreUnpacker::new(
        settings.content_dir.clone(),
        Some(pull_tx),
    ));
    tokio::spawn(async move {
        // The image puller is an external collaborator; surface its work
        // queue in the logs so operators can drive it.
        while let Some(request) = pull_rx.recv().await {
            tracing::info!(reference = %request.reference, "bundle content pull requested");
        }
    });

    let release_store = Arc::new(FileReleaseStore::new(settings.state_dir.clone()));
    let applier = Applier::new(Arc::clone(&cluster), release_store)
        .with_preflight(Box::new(CrdUpgradeSafety::new(Arc::clone(&cluster))));

    let queue = WorkQueue::new();
    let (watch_tx, mut watch_rx) = mpsc::unbounded_channel::<String>();
    let watcher = Arc::new(DynamicWatcher::new(Arc::clone(&cluster), watch_tx));
    {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            while let Some(name) = watch_rx.recv().await {
                queue.enqueue(&name);
            }
        });
    }
    {
        let queue = Arc::clone(&queue);
        let mut changes = extensions.subscribe();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(name) => queue.enqueue(&name),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let gates = Arc::new(RwLock::new(settings.feature_gates()));
    let reconciler: Arc<RuntimeReconciler> = Arc::new(Reconciler::new(
        Arc::clone(&extensions),
        Resolver::new(Arc::clone(&catalogs)),
        Arc::clone(&unpacker),
        applier,
        Arc::clone(&watcher),
        gates,
    ));

    for worker in 0..settings.workers.max(1) {
        let queue = Arc::clone(&queue);
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move {
            tracing::debug!(worker, "reconcile worker started");
            while let Some(key) = queue.next().await {
                let ok = match reconciler.reconcile(&key).await {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(extension = %key, "reconcile error: {err}");
                        false
                    }
                };
                queue.done(&key, ok);
            }
        });
    }

    {
        let settings = settings.clone();
        let catalogs = Arc::clone(&catalogs);
        let extensions = Arc::clone(&extensions);
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                settings.catalog_refresh_secs.max(1),
            ));
            loop {
                interval.tick().await;
                refresh_catalogs(&settings, &catalogs, &extensions, &queue).await;
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    queue.shutdown();
    catalogs.save_to_disk(&settings.state_dir.join(CATALOG_SNAPSHOT));
    Ok(())
}

/// What: Refresh every configured catalog and fan out reconciles for the
/// ones whose resolved content reference changed.
///
/// Details:
/// - Fetch and parse failures are logged and skipped; one bad catalog
///   must not starve the others.
pub async fn refresh_catalogs(
    settings: &Settings,
    catalogs: &catalog::Store,
    extensions: &ExtensionStore,
    queue: &WorkQueue,
) {
    let fetches = settings.catalogs.iter().map(|source| async move {
        let raw = if let Some(url) = &source.url {
            sources::fetch_catalog_contents(url).await
        } else if let Some(path) = &source.path {
            sources::read_catalog_path(path)
        } else {
            Err("catalog source has neither url nor path".into())
        };
        (source, raw)
    });
    for (source, raw) in futures::future::join_all(fetches).await {
        let raw = match raw {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(catalog = %source.name, "catalog fetch failed: {err}");
                continue;
            }
        };
        let new_ref = util::fnv1a_hex(raw.as_bytes());
        let old_ref = catalogs.resolved_ref(&source.name);
        let event = CatalogEvent {
            name: source.name.clone(),
            kind: if old_ref.is_none() {
                CatalogEventKind::Created
            } else {
                CatalogEventKind::Updated
            },
            old_ref,
            new_ref: Some(new_ref.clone()),
        };
        if !events::should_enqueue(&event) {
            continue;
        }
        let metas = match catalog::fbc::parse_stream(&raw) {
            Ok(metas) => metas,
            Err(err) => {
                tracing::warn!(catalog = %source.name, "catalog parse failed: {err}");
                continue;
            }
        };
        let contents = catalog::build_contents(&source.name, &new_ref, metas);
        tracing::info!(
            catalog = %source.name,
            bundles = contents.bundles.len(),
            resolved_ref = %new_ref,
            "catalog refreshed"
        );
        catalogs.upsert(contents);
        for name in events::fanout_requests(extensions) {
            queue.enqueue(&name);
        }
    }
}
