//! Named-list reconciliation.

use std::collections::{BTreeSet, HashSet};

use keel_core::{ContainerEnv, ContainerVolume, SpecTemplateContainer, SpecTemplateVolume, VolumeBind};

use crate::manifest::ManifestContainer;
use crate::DiffSummary;

/// Entries keyed by a stable name.
pub trait Named {
    fn name(&self) -> &str;
}

impl Named for SpecTemplateContainer {
    fn name(&self) -> &str { &self.name }
}

impl Named for ManifestContainer {
    fn name(&self) -> &str { &self.name }
}

impl Named for ContainerEnv {
    fn name(&self) -> &str { &self.name }
}

impl Named for ContainerVolume {
    fn name(&self) -> &str { &self.name }
}

impl Named for SpecTemplateVolume {
    fn name(&self) -> &str { &self.name }
}

/// Merge `desired` onto `current`.
///
/// Entries of `current` whose name is still desired survive in their existing order and
/// are passed to `update`, which reports whether a tracked field changed. Desired names
/// not present yet are built with `create` and appended in desired order. Everything else
/// is pruned. Returns the new list and whether anything changed.
pub fn reconcile<D, C>(
    desired: &[D],
    current: &[C],
    summary: &mut DiffSummary,
    mut create: impl FnMut(&D, &mut DiffSummary) -> C,
    mut update: impl FnMut(&D, &mut C, &mut DiffSummary) -> bool,
) -> (Vec<C>, bool)
where
    D: Named,
    C: Named + Clone,
{
    let mut changed = false;
    let mut out = Vec::with_capacity(desired.len());

    for c in current {
        match desired.iter().find(|d| d.name() == c.name()) {
            Some(d) => {
                let mut next = c.clone();
                if update(d, &mut next, summary) {
                    summary.updates += 1;
                    changed = true;
                }
                out.push(next);
            }
            None => {
                summary.removes += 1;
                changed = true;
            }
        }
    }

    let present: HashSet<&str> = current.iter().map(Named::name).collect();
    let mut added: HashSet<&str> = HashSet::new();
    for d in desired {
        if present.contains(d.name()) || !added.insert(d.name()) {
            continue;
        }
        out.push(create(d, summary));
        summary.adds += 1;
        changed = true;
    }

    (out, changed)
}

/// Overwrite `*slot` with `value` when they differ.
pub(crate) fn set<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

/// Bind lists are sets of `(key, file)` pairs; any difference replaces the whole list.
pub fn reconcile_binds(desired: &[VolumeBind], current: &mut Vec<VolumeBind>) -> bool {
    let want: BTreeSet<&VolumeBind> = desired.iter().collect();
    let have: BTreeSet<&VolumeBind> = current.iter().collect();
    if want == have {
        return false;
    }
    *current = unique_binds(desired);
    true
}

/// Desired binds with repeats dropped, first occurrence wins.
fn unique_binds(desired: &[VolumeBind]) -> Vec<VolumeBind> {
    let mut seen = BTreeSet::new();
    desired.iter().filter(|b| seen.insert(*b)).cloned().collect()
}

pub fn reconcile_env(desired: &[ContainerEnv], current: &[ContainerEnv], summary: &mut DiffSummary) -> (Vec<ContainerEnv>, bool) {
    reconcile(
        desired,
        current,
        summary,
        |d, _| d.clone(),
        |d, c, _| {
            let mut changed = set(&mut c.value, d.value.clone());
            changed |= set(&mut c.secret, d.secret.clone());
            changed |= set(&mut c.config, d.config.clone());
            changed
        },
    )
}

pub fn reconcile_container_volumes(
    desired: &[ContainerVolume],
    current: &[ContainerVolume],
    summary: &mut DiffSummary,
) -> (Vec<ContainerVolume>, bool) {
    reconcile(
        desired,
        current,
        summary,
        |d, _| d.clone(),
        |d, c, _| {
            let mut changed = set(&mut c.mode, d.mode.clone());
            changed |= set(&mut c.path, d.path.clone());
            changed
        },
    )
}

/// Tracked: type, secret and config names, and both bind lists.
pub fn reconcile_template_volumes(
    desired: &[SpecTemplateVolume],
    current: &[SpecTemplateVolume],
    summary: &mut DiffSummary,
) -> (Vec<SpecTemplateVolume>, bool) {
    reconcile(
        desired,
        current,
        summary,
        |d, _| {
            let mut v = d.clone();
            v.secret.binds = unique_binds(&d.secret.binds);
            v.config.binds = unique_binds(&d.config.binds);
            v
        },
        |d, c, _| {
            let mut changed = set(&mut c.kind, d.kind.clone());
            changed |= set(&mut c.secret.name, d.secret.name.clone());
            changed |= set(&mut c.config.name, d.config.name.clone());
            changed |= reconcile_binds(&d.secret.binds, &mut c.secret.binds);
            changed |= reconcile_binds(&d.config.binds, &mut c.config.binds);
            changed
        },
    )
}
