//! Prefetch executor.
//!
//! A [`Prefetch`] directive walks a relationship path from each top-level
//! instance and attaches the objects found at the end of the path as a
//! list under `to_attr`. Each level of the path costs at most one query,
//! `key IN (...)` over the keys collected from the level before, no matter
//! how many parent rows there are. Levels already joined by
//! `select_related` cost nothing, and a level with no keys issues no query.
//!
//! Every top-level instance ends up with a list under `to_attr`, empty when
//! nothing matched.

use std::collections::HashSet;

use indexmap::IndexMap;

use edgy_rs_core::{EdgyError, EdgyResult};

use super::compiler::{ThroughLink, LINK_LABEL};
use super::lookups::{LookupOp, Q, LOOKUP_SEP};
use super::queryset::QuerySet;
use crate::connections::DbContext;
use crate::instance::{Instance, Relation};
use crate::model::{ModelMeta, RelationInfo};
use crate::value::{Value, ValueKey};

/// One prefetch directive.
///
/// # Examples
///
/// ```
/// use edgy_rs_db::query::Prefetch;
///
/// let p = Prefetch::new("albums__tracks", "all_tracks");
/// assert_eq!(p.related_name(), "albums__tracks");
/// assert_eq!(p.to_attr(), "all_tracks");
/// ```
#[derive(Debug, Clone)]
pub struct Prefetch {
    pub(crate) related_name: String,
    pub(crate) to_attr: String,
    pub(crate) queryset: Option<QuerySet>,
}

impl Prefetch {
    /// Prefetches `related_name` (a `__`-separated relationship path) into
    /// `to_attr`.
    pub fn new(related_name: impl Into<String>, to_attr: impl Into<String>) -> Self {
        Self {
            related_name: related_name.into(),
            to_attr: to_attr.into(),
            queryset: None,
        }
    }

    /// Filters and orders the final level with `queryset`.
    ///
    /// A limit on `queryset` applies to the whole level, not per parent.
    #[must_use]
    pub fn with_queryset(mut self, queryset: QuerySet) -> Self {
        self.queryset = Some(queryset);
        self
    }

    /// The relationship path.
    pub fn related_name(&self) -> &str {
        &self.related_name
    }

    /// The attribute the results are attached under.
    pub fn to_attr(&self) -> &str {
        &self.to_attr
    }
}

fn resolve_path(
    model: &'static ModelMeta,
    path: &str,
) -> EdgyResult<Vec<RelationInfo>> {
    let mut meta = model;
    let mut hops = Vec::new();
    for segment in path.split(LOOKUP_SEP) {
        let rel = meta.relation(segment).ok_or_else(|| {
            EdgyError::ConfigurationError(format!(
                "Cannot prefetch '{path}': '{segment}' is not a relationship of {}",
                meta.name
            ))
        })?;
        meta = rel.target_meta();
        hops.push(rel);
    }
    Ok(hops)
}

/// Checks directives against `model` without touching the database.
pub(crate) fn validate(model: &'static ModelMeta, directives: &[Prefetch]) -> EdgyResult<()> {
    let mut attrs = HashSet::new();
    for directive in directives {
        let hops = resolve_path(model, &directive.related_name)?;
        let target = hops.last().map_or(model, RelationInfo::target_meta);
        if let Some(qs) = &directive.queryset {
            if !std::ptr::eq(qs.model, target) {
                return Err(EdgyError::ConfigurationError(format!(
                    "The queryset for prefetch '{}' is over {}, but the path ends at {}",
                    directive.related_name, qs.model.name, target.name
                )));
            }
            validate(qs.model, &qs.prefetch_related)?;
        }
        if model.has_attribute(&directive.to_attr) {
            return Err(EdgyError::ConfigurationError(format!(
                "to_attr '{}' of prefetch '{}' collides with a field or relationship of {}",
                directive.to_attr, directive.related_name, model.name
            )));
        }
        if !attrs.insert(directive.to_attr.as_str()) {
            return Err(EdgyError::ConfigurationError(format!(
                "to_attr '{}' is used by more than one prefetch",
                directive.to_attr
            )));
        }
    }
    Ok(())
}

/// Runs every directive over `instances`.
pub(crate) async fn prefetch_all(
    instances: &mut [Instance],
    directives: &[Prefetch],
    db: &DbContext,
) -> EdgyResult<()> {
    if instances.is_empty() {
        return Ok(());
    }
    for directive in directives {
        run_directive(instances, directive, db).await?;
    }
    Ok(())
}

async fn run_directive(
    instances: &mut [Instance],
    directive: &Prefetch,
    db: &DbContext,
) -> EdgyResult<()> {
    let model = instances[0].meta();
    let hops = resolve_path(model, &directive.related_name)?;
    let mut frontier: Vec<(usize, Instance)> = instances.iter().cloned().enumerate().collect();

    for (level, rel) in hops.iter().enumerate() {
        let last = level + 1 == hops.len();
        let queryset = if last { directive.queryset.as_ref() } else { None };

        // A to-one level joined by select_related is already in memory.
        let joined = rel.kind.is_to_one()
            && queryset.is_none()
            && frontier.iter().all(|(_, inst)| {
                matches!(inst.relation(rel.name), Some(Relation::Loaded(_) | Relation::Null))
            });
        if joined {
            frontier = frontier
                .into_iter()
                .filter_map(|(top, inst)| match inst.relation(rel.name) {
                    Some(Relation::Loaded(child)) => Some((top, (**child).clone())),
                    _ => None,
                })
                .collect();
            continue;
        }

        let mut seen = HashSet::new();
        let keys: Vec<Value> = frontier
            .iter()
            .filter_map(|(_, inst)| inst.values().get(rel.local_field))
            .filter(|key| !key.is_null() && seen.insert(key.key()))
            .cloned()
            .collect();
        let found = if keys.is_empty() {
            Vec::new()
        } else {
            fetch_related(rel, keys, queryset, db).await?
        };

        let mut groups: IndexMap<ValueKey, Vec<Instance>> = IndexMap::new();
        for (key, inst) in found {
            groups.entry(key).or_default().push(inst);
        }
        frontier = frontier
            .iter()
            .filter_map(|(top, inst)| {
                let key = inst.values().get(rel.local_field)?.key();
                groups.get(&key).map(|children| (*top, children))
            })
            .flat_map(|(top, children)| children.iter().cloned().map(move |c| (top, c)))
            .collect();
    }

    let mut lists: Vec<Vec<Instance>> = vec![Vec::new(); instances.len()];
    let mut seen: Vec<HashSet<ValueKey>> = vec![HashSet::new(); instances.len()];
    for (top, inst) in frontier {
        if seen[top].insert(inst.pk_key()) {
            lists[top].push(inst);
        }
    }
    for (inst, list) in instances.iter_mut().zip(lists) {
        inst.attach(&directive.to_attr, list);
    }
    Ok(())
}

/// Fetches the rows on the far side of `rel` for `keys`, each paired with
/// the near-side key it belongs to. Runs exactly one query.
pub(crate) async fn fetch_related(
    rel: &RelationInfo,
    keys: Vec<Value>,
    queryset: Option<&QuerySet>,
    db: &DbContext,
) -> EdgyResult<Vec<(ValueKey, Instance)>> {
    let target = rel.target_meta();
    let base = queryset.cloned().unwrap_or_else(|| QuerySet::new(target));
    let mut qs = base.with_db(db.clone());
    tracing::trace!(relation = rel.name, model = target.name, keys = keys.len(), "prefetching");

    if let Some(through) = rel.through {
        qs.link = Some(ThroughLink {
            through,
            remote_column: rel.remote_column.clone(),
            keys,
        });
        let rows = qs.all_boxed().await?;
        return Ok(rows
            .into_iter()
            .map(|mut inst| {
                let key = inst.take_annotation(LINK_LABEL).unwrap_or(Value::Null).key();
                (key, inst)
            })
            .collect());
    }

    qs = qs.filter(Q::filter(rel.remote_field, LookupOp::In, Value::List(keys)));
    qs.required_fields.push(rel.remote_field.to_string());
    let rows = qs.all_boxed().await?;
    Ok(rows
        .into_iter()
        .map(|inst| {
            let key = inst
                .values()
                .get(rel.remote_field)
                .map_or(ValueKey::Null, Value::key);
            (key, inst)
        })
        .collect())
}
