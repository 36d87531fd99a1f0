use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::domain::{BidsEntity, Fingerprint, RawAsset, SourceKey};
use crate::manifest::{ManifestRecord, ManifestStore};
use crate::naming::StructuredIdentifier;

#[derive(Debug, Clone)]
pub struct ResolvedAsset {
    pub asset: RawAsset,
    pub identifier: StructuredIdentifier,
    pub entity: BidsEntity,
    pub key: SourceKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    New,
    Unchanged,
    Conflict,
    Drift,
}

impl PlanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::New => "new",
            PlanStatus::Unchanged => "unchanged",
            PlanStatus::Conflict => "conflict",
            PlanStatus::Drift => "drift",
        }
    }

    pub fn is_settled(self) -> bool {
        matches!(self, PlanStatus::New | PlanStatus::Unchanged)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanNote {
    DuplicateOf { source: Utf8PathBuf },
    ConflictsWith { sources: Vec<Utf8PathBuf> },
    Drift {
        previous_destination: Option<Utf8PathBuf>,
        previous_fingerprint: Option<Fingerprint>,
        owner: Option<SourceKey>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionPlanEntry {
    pub key: SourceKey,
    pub source: Utf8PathBuf,
    pub destination: Utf8PathBuf,
    pub entity: BidsEntity,
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub status: PlanStatus,
    pub note: Option<PlanNote>,
    pub prior_version: Option<u32>,
}

impl ConversionPlanEntry {
    pub fn is_duplicate(&self) -> bool {
        matches!(self.note, Some(PlanNote::DuplicateOf { .. }))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanCounts {
    pub new: usize,
    pub unchanged: usize,
    pub conflict: usize,
    pub drift: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub entries: Vec<ConversionPlanEntry>,
}

impl Plan {
    pub fn counts(&self) -> PlanCounts {
        let mut counts = PlanCounts::default();
        for entry in &self.entries {
            match entry.status {
                PlanStatus::New => counts.new += 1,
                PlanStatus::Unchanged => counts.unchanged += 1,
                PlanStatus::Conflict => counts.conflict += 1,
                PlanStatus::Drift => counts.drift += 1,
            }
        }
        counts
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PathPlanner;

impl PathPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Builds the plan for one batch. The result depends only on the set of
    /// assets and the manifest, never on the order the assets arrive in.
    pub fn plan(&self, assets: Vec<ResolvedAsset>, manifest: &ManifestStore) -> Plan {
        let mut groups = BTreeMap::<Utf8PathBuf, Vec<ResolvedAsset>>::new();
        for asset in assets {
            groups
                .entry(asset.entity.relative_path())
                .or_default()
                .push(asset);
        }

        let mut entries = Vec::new();
        for (destination, mut members) in groups {
            members.sort_by(|a, b| {
                a.asset
                    .relative
                    .cmp(&b.asset.relative)
                    .then_with(|| a.key.cmp(&b.key))
            });

            let fingerprints = members
                .iter()
                .map(|member| &member.asset.fingerprint)
                .collect::<BTreeSet<_>>();
            if fingerprints.len() > 1 {
                tracing::warn!(
                    "{} sources with different content map to {destination}",
                    members.len()
                );
                for member in &members {
                    let others = members
                        .iter()
                        .filter(|other| other.asset.relative != member.asset.relative)
                        .map(|other| other.asset.relative.clone())
                        .collect();
                    let prior_version = manifest.lookup(&member.key).map(|record| record.version);
                    entries.push(entry(
                        member,
                        &destination,
                        PlanStatus::Conflict,
                        Some(PlanNote::ConflictsWith { sources: others }),
                        prior_version,
                    ));
                }
                continue;
            }

            let Some(pick) = representative_index(&members, &destination, manifest) else {
                continue;
            };
            let representative = members.remove(pick);
            for duplicate in members {
                let prior_version = manifest.lookup(&duplicate.key).map(|record| record.version);
                entries.push(entry(
                    &duplicate,
                    &destination,
                    PlanStatus::Unchanged,
                    Some(PlanNote::DuplicateOf {
                        source: representative.asset.relative.clone(),
                    }),
                    prior_version,
                ));
            }
            entries.push(compare_with_manifest(
                &representative,
                &destination,
                manifest,
            ));
        }

        entries.sort_by(|a, b| {
            a.entity
                .cmp(&b.entity)
                .then_with(|| a.source.cmp(&b.source))
        });
        Plan { entries }
    }
}

fn representative_index(
    members: &[ResolvedAsset],
    destination: &Utf8Path,
    manifest: &ManifestStore,
) -> Option<usize> {
    if members.is_empty() {
        return None;
    }
    // Recorded member first, then the destination's owner, then path order.
    let recorded = members.iter().position(|member| {
        manifest.lookup(&member.key).is_some_and(|record| {
            record.destination.as_path() == destination
                && record.fingerprint == member.asset.fingerprint
        })
    });
    let owned = || {
        let owner = manifest.owner_of(destination)?;
        members.iter().position(|member| member.key == owner)
    };
    Some(recorded.or_else(owned).unwrap_or(0))
}

fn compare_with_manifest(
    asset: &ResolvedAsset,
    destination: &Utf8Path,
    manifest: &ManifestStore,
) -> ConversionPlanEntry {
    let owner = manifest
        .owner_of(destination)
        .filter(|owner| owner != &asset.key);
    let prior = manifest.lookup(&asset.key);
    let prior_version = prior.as_ref().map(|record| record.version);

    let drift = |prior: Option<&ManifestRecord>| PlanNote::Drift {
        previous_destination: prior.map(|record| record.destination.clone()),
        previous_fingerprint: prior.map(|record| record.fingerprint.clone()),
        owner: owner.clone(),
    };

    let (status, note) = match &prior {
        _ if owner.is_some() => (PlanStatus::Drift, Some(drift(prior.as_ref()))),
        None => (PlanStatus::New, None),
        Some(record)
            if record.destination.as_path() == destination
                && record.fingerprint == asset.asset.fingerprint =>
        {
            (PlanStatus::Unchanged, None)
        }
        Some(record) => (PlanStatus::Drift, Some(drift(Some(record)))),
    };
    if status == PlanStatus::Drift {
        tracing::debug!("drift detected for {}", asset.key);
    }
    entry(asset, destination, status, note, prior_version)
}

fn entry(
    asset: &ResolvedAsset,
    destination: &Utf8Path,
    status: PlanStatus,
    note: Option<PlanNote>,
    prior_version: Option<u32>,
) -> ConversionPlanEntry {
    ConversionPlanEntry {
        key: asset.key.clone(),
        source: asset.asset.relative.clone(),
        destination: destination.to_path_buf(),
        entity: asset.entity.clone(),
        fingerprint: asset.asset.fingerprint.clone(),
        size: asset.asset.size,
        status,
        note,
        prior_version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldTable;
    use crate::fs_util::fingerprint_bytes;
    use crate::naming::NamingParser;
    use crate::participants::ParticipantTable;
    use crate::resolver::EntityResolver;

    fn resolved(relative: &str, content: &[u8]) -> ResolvedAsset {
        let fields = FieldTable::builtin();
        let participants = ParticipantTable::empty();
        let name = relative.rsplit('/').next().unwrap();
        let identifier = NamingParser::new().parse(name).unwrap();
        let entity = EntityResolver::new(&fields, &participants)
            .resolve(&identifier)
            .unwrap();
        ResolvedAsset {
            asset: RawAsset {
                path: Utf8PathBuf::from("/src").join(relative),
                relative: Utf8PathBuf::from(relative),
                size: content.len() as u64,
                fingerprint: fingerprint_bytes(content),
            },
            key: identifier.source_key(),
            identifier,
            entity,
        }
    }

    #[test]
    fn identical_copies_collapse_onto_first_source() {
        let manifest = ManifestStore::in_memory();
        let plan = PathPlanner::new().plan(
            vec![
                resolved("b/1000001_20252_2_0.zip", b"same"),
                resolved("a/1000001_20252_2_0.zip", b"same"),
            ],
            &manifest,
        );
        assert_eq!(plan.entries.len(), 2);
        assert_eq!(plan.entries[0].source, "a/1000001_20252_2_0.zip");
        assert_eq!(plan.entries[0].status, PlanStatus::New);
        assert_eq!(plan.entries[1].status, PlanStatus::Unchanged);
        assert!(plan.entries[1].is_duplicate());
    }

    #[test]
    fn differing_copies_conflict() {
        let manifest = ManifestStore::in_memory();
        let plan = PathPlanner::new().plan(
            vec![
                resolved("a/1000001_20252_2_0.zip", b"one"),
                resolved("b/1000001_20252_2_0.zip", b"two"),
            ],
            &manifest,
        );
        assert_eq!(plan.counts().conflict, 2);
    }

    #[test]
    fn changed_content_is_drift() {
        let manifest = ManifestStore::in_memory();
        let asset = resolved("1000001_20252_2_0.zip", b"v2");
        manifest
            .commit(
                ManifestRecord::new(
                    asset.key.clone(),
                    asset.asset.relative.clone(),
                    asset.entity.relative_path(),
                    fingerprint_bytes(b"v1"),
                    2,
                ),
                None,
            )
            .unwrap();
        let plan = PathPlanner::new().plan(vec![asset], &manifest);
        assert_eq!(plan.entries[0].status, PlanStatus::Drift);
        assert_eq!(plan.entries[0].prior_version, Some(1));
    }
}
