//! The reconciler: one pass of the pipeline per enqueued request.
//!
//! A pass runs finalize → validate → resolve → unpack → apply → watch and
//! projects a complete condition set whatever the outcome. The working
//! copy's spec and non-finalizer metadata are never mutated; a detected
//! mutation is a logic bug and panics the process. Status and finalizer
//! diffs are persisted through separate store updates, and any update
//! error is aggregated with the pass error so the queue retries with
//! backoff.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::apply::{
    Applier, ApplyError, LABEL_BUNDLE_NAME, LABEL_BUNDLE_VERSION, LABEL_OWNER_KIND,
    LABEL_OWNER_NAME, LABEL_PACKAGE_NAME, OWNER_KIND,
};
use crate::catalog::BundleProvider;
use crate::cluster::{ClientProvider, ExtensionStore, ExtensionStoreError};
use crate::config::FeatureGates;
use crate::logic::deprecation;
use crate::resolve::{self, DeprecationOutcome, ResolveError, Resolver};
use crate::state::conditions::{self, ConditionReason, ConditionStatus, ConditionType};
use crate::state::{
    BundleMetadata, ClusterExtension, InstallStatus, ResolutionStatus,
};
use crate::unpack::{BundleSource, UnpackError, UnpackState, Unpacker};
use crate::util::validate;
use crate::watch::{DynamicWatcher, WatchError};

/// Finalizer key guarding release cleanup.
pub const CLEANUP_FINALIZER: &str = "olm.operatorframework.io/cleanup";

const MSG_INSTALL_NOT_ATTEMPTED_RESOLUTION: &str =
    "installation has not been attempted as resolution failed";
const MSG_DEPRECATION_NOT_ATTEMPTED_RESOLUTION: &str =
    "deprecation checks have not been attempted as resolution failed";
const MSG_INSTALL_NOT_ATTEMPTED_UNPACK: &str =
    "installation has not been attempted as unpack is pending";
const MSG_VALIDATION_NOT_ATTEMPTED: &str = "validation has not been attempted as spec is invalid";
const MSG_INSTALL_NOT_ATTEMPTED_INVALID: &str =
    "installation has not been attempted as spec is invalid";

/// Failure of one reconcile pass.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Resolution failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// The unpacker itself failed.
    #[error("source bundle content: {0}")]
    Unpack(#[from] UnpackError),
    /// The unpacker reported a terminal failure state.
    #[error("unpacking bundle: {0}")]
    UnpackFailed(String),
    /// The unpacker reported an inconsistent result.
    #[error("unexpected unpack status: {0}")]
    UnexpectedUnpackStatus(String),
    /// Applying the rendered content failed.
    #[error(transparent)]
    Apply(#[from] ApplyError),
    /// Watch registration failed.
    #[error(transparent)]
    Watch(#[from] WatchError),
    /// Persisting status or finalizers failed.
    #[error(transparent)]
    Store(#[from] ExtensionStoreError),
    /// The pass error combined with a persist error.
    #[error("{0}")]
    Aggregate(String),
}

/// Orchestrates the reconciliation pipeline.
pub struct Reconciler<P: BundleProvider, U: Unpacker, C: ClientProvider> {
    extensions: Arc<ExtensionStore>,
    resolver: Resolver<P>,
    unpacker: U,
    applier: Applier<C>,
    watcher: Arc<DynamicWatcher>,
    gates: Arc<RwLock<FeatureGates>>,
}

impl<P: BundleProvider, U: Unpacker, C: ClientProvider> Reconciler<P, U, C> {
    /// Wire a reconciler from its collaborators.
    pub fn new(
        extensions: Arc<ExtensionStore>,
        resolver: Resolver<P>,
        unpacker: U,
        applier: Applier<C>,
        watcher: Arc<DynamicWatcher>,
        gates: Arc<RwLock<FeatureGates>>,
    ) -> Self {
        Self {
            extensions,
            resolver,
            unpacker,
            applier,
            watcher,
            gates,
        }
    }

    /// What: Run one reconcile pass for the named extension.
    ///
    /// Inputs:
    /// - `name`: Extension name from the work queue.
    ///
    /// Output:
    /// - `Ok` for clean exits (including not-found and non-terminal unpack
    ///   states); `Err` for anything the queue should retry with backoff.
    ///
    /// Details:
    /// - Panics when the pass mutated spec or non-finalizer metadata.
    pub async fn reconcile(&self, name: &str) -> Result<(), ReconcileError> {
        let Some(existing) = self.extensions.get(name) else {
            return Ok(());
        };
        let mut working = existing.clone();
        let result = self.reconcile_inner(&mut working).await;
        if let Err(err) = &result {
            tracing::warn!(extension = name, "reconcile failed: {err}");
        }
        // Conditions carried over from earlier passes still describe this
        // generation's observation point.
        let generation = working.generation();
        for condition in &mut working.status.conditions {
            condition.observed_generation = generation;
        }

        if unexpected_field_change(&existing, &working) {
            panic!("reconciler mutated spec or non-finalizer metadata of {name:?}");
        }

        let mut persist_errors: Vec<String> = Vec::new();
        if working.status != existing.status
            && let Err(e) = self.extensions.update_status(&working)
        {
            persist_errors.push(e.to_string());
        }
        if working.metadata.finalizers != existing.metadata.finalizers
            && let Err(e) = self.extensions.update_finalizers(&working)
        {
            persist_errors.push(e.to_string());
        }
        match (result, persist_errors.is_empty()) {
            (result, true) => result,
            (Ok(()), false) => Err(ReconcileError::Aggregate(persist_errors.join("; "))),
            (Err(err), false) => Err(ReconcileError::Aggregate(format!(
                "{err}; {}",
                persist_errors.join("; ")
            ))),
        }
    }

    async fn reconcile_inner(&self, ext: &mut ClusterExtension) -> Result<(), ReconcileError> {
        let generation = ext.generation();
        if self.finalize(ext)? {
            // Finalizer chain updated metadata (or the object is
            // terminating); requeue without further work.
            return Ok(());
        }

        if let Err(reason) = validate_spec(ext) {
            tracing::debug!(extension = ext.name(), "spec invalid: {reason}");
            ext.status.resolution = None;
            conditions::set(
                &mut ext.status.conditions,
                ConditionType::Resolved,
                ConditionStatus::Unknown,
                ConditionReason::ResolutionUnknown,
                MSG_VALIDATION_NOT_ATTEMPTED,
                generation,
            );
            ext.status.install = None;
            conditions::set(
                &mut ext.status.conditions,
                ConditionType::Installed,
                ConditionStatus::Unknown,
                ConditionReason::InstallationStatusUnknown,
                MSG_INSTALL_NOT_ATTEMPTED_INVALID,
                generation,
            );
            conditions::ensure_all_with_reason(
                &mut ext.status.conditions,
                ConditionReason::ResolutionUnknown,
                MSG_VALIDATION_NOT_ATTEMPTED,
                generation,
            );
            // Retrying cannot fix an invalid spec; exit without error.
            return Ok(());
        }

        let installed = match self.applier.installed_bundle(ext) {
            Ok(installed) => installed,
            Err(err) => {
                conditions::set(
                    &mut ext.status.conditions,
                    ConditionType::Installed,
                    ConditionStatus::False,
                    err.reason(),
                    &err.to_string(),
                    generation,
                );
                conditions::ensure_all_with_reason(
                    &mut ext.status.conditions,
                    err.reason(),
                    &err.to_string(),
                    generation,
                );
                return Err(err.into());
            }
        };

        let force_semver = {
            // Read the gate once so a mid-pass flip cannot split behavior.
            let gates = self.gates.read().unwrap_or_else(|e| e.into_inner());
            gates.force_semver_upgrade_constraints
        };
        let resolution = match resolve::ensure_unique_package(&self.extensions.list(), ext) {
            Err(err) => Err(err),
            Ok(()) => {
                self.resolver
                    .resolve(ext, installed.as_ref(), force_semver)
                    .await
            }
        };
        let resolution = match resolution {
            Ok(resolution) => resolution,
            Err(err) => {
                let message = err.to_string();
                ext.status.resolution = None;
                ext.status.install = None;
                conditions::set(
                    &mut ext.status.conditions,
                    ConditionType::Resolved,
                    ConditionStatus::False,
                    ConditionReason::ResolutionFailed,
                    &message,
                    generation,
                );
                conditions::set(
                    &mut ext.status.conditions,
                    ConditionType::Installed,
                    ConditionStatus::Unknown,
                    ConditionReason::InstallationStatusUnknown,
                    MSG_INSTALL_NOT_ATTEMPTED_RESOLUTION,
                    generation,
                );
                deprecation::set_deprecation_statuses_unknown(
                    ext,
                    MSG_DEPRECATION_NOT_ATTEMPTED_RESOLUTION,
                );
                conditions::ensure_all_with_reason(
                    &mut ext.status.conditions,
                    ConditionReason::ResolutionFailed,
                    &message,
                    generation,
                );
                return Err(err.into());
            }
        };

        let bundle = resolution.bundle;
        let version = resolution.version;
        tracing::info!(
            extension = ext.name(),
            bundle = %bundle.name,
            version = %version,
            "resolved bundle"
        );
        ext.status.resolution = Some(ResolutionStatus {
            bundle: BundleMetadata {
                name: bundle.name.clone(),
                version: version.to_string(),
            },
        });
        conditions::set(
            &mut ext.status.conditions,
            ConditionType::Resolved,
            ConditionStatus::True,
            ConditionReason::Success,
            &format!("resolved to {:?}", bundle.image),
            generation,
        );

        match &resolution.deprecation {
            DeprecationOutcome::None => {
                deprecation::set_deprecation_status(ext, &bundle.name, &[]);
            }
            DeprecationOutcome::Entries(entries) => {
                deprecation::set_deprecation_status(ext, &bundle.name, entries);
            }
            DeprecationOutcome::Divergent(catalogs) => {
                deprecation::set_deprecation_statuses_unknown(
                    ext,
                    &format!(
                        "deprecation information for package {:?} differs between catalogs {catalogs:?}",
                        bundle.package
                    ),
                );
            }
        }

        let source = BundleSource::image(&bundle.image);
        let unpack_result = match self.unpacker.unpack(&source).await {
            Ok(result) => result,
            Err(err) => {
                let wrapped = ReconcileError::from(err);
                conditions::set(
                    &mut ext.status.conditions,
                    ConditionType::Unpacked,
                    ConditionStatus::False,
                    ConditionReason::UnpackFailed,
                    &wrapped.to_string(),
                    generation,
                );
                conditions::ensure_all_with_reason(
                    &mut ext.status.conditions,
                    ConditionReason::UnpackFailed,
                    &wrapped.to_string(),
                    generation,
                );
                return Err(wrapped);
            }
        };
        let fs = match unpack_result.state {
            UnpackState::Pending | UnpackState::Unpacking => {
                conditions::set(
                    &mut ext.status.conditions,
                    ConditionType::Unpacked,
                    ConditionStatus::False,
                    ConditionReason::UnpackPending,
                    &unpack_result.message,
                    generation,
                );
                conditions::set(
                    &mut ext.status.conditions,
                    ConditionType::Installed,
                    ConditionStatus::Unknown,
                    ConditionReason::InstallationStatusUnknown,
                    MSG_INSTALL_NOT_ATTEMPTED_UNPACK,
                    generation,
                );
                conditions::ensure_all_with_reason(
                    &mut ext.status.conditions,
                    ConditionReason::UnpackPending,
                    &unpack_result.message,
                    generation,
                );
                // Non-terminal; the next event re-enters the loop.
                return Ok(());
            }
            UnpackState::Failed => {
                let err = ReconcileError::UnpackFailed(unpack_result.message.clone());
                conditions::set(
                    &mut ext.status.conditions,
                    ConditionType::Unpacked,
                    ConditionStatus::False,
                    ConditionReason::UnpackFailed,
                    &err.to_string(),
                    generation,
                );
                conditions::ensure_all_with_reason(
                    &mut ext.status.conditions,
                    ConditionReason::UnpackFailed,
                    &err.to_string(),
                    generation,
                );
                return Err(err);
            }
            UnpackState::Unpacked => match unpack_result.bundle {
                Some(fs) => {
                    conditions::set(
                        &mut ext.status.conditions,
                        ConditionType::Unpacked,
                        ConditionStatus::True,
                        ConditionReason::UnpackSuccessful,
                        &unpack_result.message,
                        generation,
                    );
                    fs
                }
                None => {
                    let err = ReconcileError::UnexpectedUnpackStatus(
                        "unpacked without bundle content".into(),
                    );
                    conditions::set(
                        &mut ext.status.conditions,
                        ConditionType::Unpacked,
                        ConditionStatus::False,
                        ConditionReason::UnpackFailed,
                        &err.to_string(),
                        generation,
                    );
                    conditions::ensure_all_with_reason(
                        &mut ext.status.conditions,
                        ConditionReason::UnpackFailed,
                        &err.to_string(),
                        generation,
                    );
                    return Err(err);
                }
            },
        };

        let owner_labels: BTreeMap<String, String> = [
            (LABEL_OWNER_KIND.to_string(), OWNER_KIND.to_string()),
            (LABEL_OWNER_NAME.to_string(), ext.name().to_string()),
        ]
        .into_iter()
        .collect();
        let store_labels: BTreeMap<String, String> = [
            (LABEL_BUNDLE_NAME.to_string(), bundle.name.clone()),
            (LABEL_PACKAGE_NAME.to_string(), bundle.package.clone()),
            (LABEL_BUNDLE_VERSION.to_string(), version.to_string()),
        ]
        .into_iter()
        .collect();
        let (objects, release_state) =
            match self.applier.apply(&fs, ext, &owner_labels, &store_labels) {
                Ok(applied) => applied,
                Err(err) => {
                    conditions::set(
                        &mut ext.status.conditions,
                        ConditionType::Installed,
                        ConditionStatus::False,
                        err.reason(),
                        &err.to_string(),
                        generation,
                    );
                    conditions::ensure_all_with_reason(
                        &mut ext.status.conditions,
                        err.reason(),
                        &err.to_string(),
                        generation,
                    );
                    return Err(err.into());
                }
            };
        tracing::info!(
            extension = ext.name(),
            bundle = %bundle.name,
            state = ?release_state,
            objects = objects.len(),
            "applied bundle"
        );
        ext.status.install = Some(InstallStatus {
            bundle: BundleMetadata {
                name: bundle.name.clone(),
                version: version.to_string(),
            },
        });
        conditions::set(
            &mut ext.status.conditions,
            ConditionType::Installed,
            ConditionStatus::True,
            ConditionReason::Success,
            &format!("Installed bundle {:?} successfully", bundle.image),
            generation,
        );

        match self.watcher.ensure_watches(&objects) {
            Ok(()) => {
                // Verified; absence of Healthy means Unknown, presence of
                // no condition here means "nothing unverifiable".
                conditions::remove_condition(&mut ext.status.conditions, ConditionType::Healthy);
            }
            Err(err) => {
                conditions::set(
                    &mut ext.status.conditions,
                    ConditionType::Healthy,
                    ConditionStatus::Unknown,
                    ConditionReason::Unverifiable,
                    &err.to_string(),
                    generation,
                );
                conditions::ensure_all_with_reason(
                    &mut ext.status.conditions,
                    ConditionReason::Unverifiable,
                    &err.to_string(),
                    generation,
                );
                return Err(err.into());
            }
        }

        conditions::ensure_all_with_reason(
            &mut ext.status.conditions,
            ConditionReason::Success,
            "",
            generation,
        );
        Ok(())
    }

    /// Finalizer chain: ensure the cleanup finalizer on live objects, run
    /// cleanup and release the finalizer on terminating ones. Returns
    /// whether the pass should stop here.
    fn finalize(&self, ext: &mut ClusterExtension) -> Result<bool, ReconcileError> {
        if ext.metadata.deletion_timestamp.is_some() {
            if ext.metadata.finalizers.iter().any(|f| f == CLEANUP_FINALIZER) {
                self.applier.uninstall(ext)?;
                ext.metadata.finalizers.retain(|f| f != CLEANUP_FINALIZER);
                tracing::info!(extension = ext.name(), "finalized and released");
            }
            return Ok(true);
        }
        if !ext.metadata.finalizers.iter().any(|f| f == CLEANUP_FINALIZER) {
            ext.metadata.finalizers.push(CLEANUP_FINALIZER.to_string());
            return Ok(true);
        }
        Ok(false)
    }
}

/// Spec validation the reconciler re-runs in case admission was bypassed.
/// Checks the same five fields as the admission stub: package name,
/// version range, channel names, install namespace, and service account.
fn validate_spec(ext: &ClusterExtension) -> Result<(), String> {
    let Some(catalog) = &ext.spec.source.catalog else {
        return Err("spec.source.catalog is required".into());
    };
    if !validate::is_valid_package_name(&catalog.package_name, false) {
        return Err(format!("invalid package name {:?}", catalog.package_name));
    }
    if !validate::is_valid_version_range(&catalog.version) {
        return Err(format!("invalid version range {:?}", catalog.version));
    }
    for channel in &catalog.channels {
        if !validate::is_valid_channel_name(channel, false) {
            return Err(format!("invalid channel name {channel:?}"));
        }
    }
    if !validate::is_dns1123_label(&ext.spec.install.namespace) {
        return Err(format!(
            "invalid install namespace {:?}",
            ext.spec.install.namespace
        ));
    }
    if !validate::is_dns1123_subdomain(&ext.spec.install.service_account.name) {
        return Err(format!(
            "invalid service account name {:?}",
            ext.spec.install.service_account.name
        ));
    }
    Ok(())
}

/// True when anything outside status and finalizers differs.
fn unexpected_field_change(original: &ClusterExtension, reconciled: &ClusterExtension) -> bool {
    if original.spec != reconciled.spec {
        return true;
    }
    let mut a = original.metadata.clone();
    let mut b = reconciled.metadata.clone();
    a.finalizers = Vec::new();
    b.finalizers = Vec::new();
    a != b
}
