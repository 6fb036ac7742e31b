//! Row materializer.
//!
//! Splits one result row into the base instance plus every model joined in
//! by `select_related`, following the [`Projection`] the compiler produced.
//! Relationships that were not joined become stubs carrying the key that
//! resolves them, so `Instance::load` needs no further bookkeeping.

use edgy_rs_core::{EdgyError, EdgyResult};

use super::compiler::{ModelProjection, Projection};
use super::sql::Row;
use crate::connections::DbContext;
use crate::instance::{Instance, Relation};
use crate::model::RelationKind;
use crate::value::Value;

/// Builds instances from rows of one compiled query.
pub struct Materializer<'a> {
    projection: &'a Projection,
    db: DbContext,
}

impl<'a> Materializer<'a> {
    /// A materializer whose instances are bound to `db`.
    pub const fn new(projection: &'a Projection, db: DbContext) -> Self {
        Self { projection, db }
    }

    /// Materializes one row.
    pub fn materialize(&self, row: &Row) -> EdgyResult<Instance> {
        let mut base = build(&self.projection.base, row, &self.db)?;

        let mut related: Vec<(&[String], Option<Instance>)> = self
            .projection
            .related
            .iter()
            .map(|r| {
                let inst = build(&r.model, row, &self.db)?;
                Ok((r.path.as_slice(), has_pk(&inst).then_some(inst)))
            })
            .collect::<EdgyResult<_>>()?;

        // Parents precede children, so attaching from the back nests
        // every child before its parent is attached in turn.
        while let Some((path, child)) = related.pop() {
            let Some((name, parent_path)) = path.split_last() else {
                continue;
            };
            let relation = child.map_or(Relation::Null, |c| Relation::Loaded(Box::new(c)));
            if parent_path.is_empty() {
                base.set_relation(name, relation);
            } else if let Some((_, Some(parent))) =
                related.iter_mut().find(|(p, _)| *p == parent_path)
            {
                parent.set_relation(name, relation);
            }
        }

        for (alias, index) in &self.projection.extras {
            base.set_annotation(alias, cell(row, *index, base.meta().name, alias)?);
        }
        Ok(base)
    }
}

fn cell(row: &Row, index: usize, model: &str, name: &str) -> EdgyResult<Value> {
    row.value_at(index).cloned().ok_or_else(|| {
        EdgyError::DatabaseError(format!(
            "Result row has no column {index} for {model}.{name}"
        ))
    })
}

fn has_pk(inst: &Instance) -> bool {
    match inst.pk() {
        Value::Null => false,
        Value::List(parts) => parts.iter().all(|p| !p.is_null()),
        _ => true,
    }
}

fn build(model: &ModelProjection, row: &Row, db: &DbContext) -> EdgyResult<Instance> {
    let meta = model.meta;
    let mut inst = Instance::new(meta, db.clone());
    inst.set_partial(model.partial);
    for (name, index) in &model.columns {
        let raw = cell(row, *index, meta.name, name)?;
        let value = match meta.get_field(name) {
            Some(field) => field.field_type.coerce(raw),
            None => raw,
        };
        inst.insert_raw(name, value);
    }
    attach_stubs(&mut inst);
    Ok(inst)
}

/// Gives every relationship whose key is loaded an unloaded stub.
///
/// Forward to-one relationships with a NULL key become [`Relation::Null`].
pub(crate) fn attach_stubs(inst: &mut Instance) {
    for rel in inst.meta().relations() {
        let Some(key) = inst.values().get(rel.local_field).cloned() else {
            continue;
        };
        let stub = match rel.kind {
            RelationKind::ForeignKey | RelationKind::OneToOne if key.is_null() => Relation::Null,
            RelationKind::ForeignKey | RelationKind::OneToOne | RelationKind::ReverseOneToOne => {
                Relation::Unloaded(key)
            }
            RelationKind::ReverseForeignKey | RelationKind::ManyToMany => Relation::UnloadedMany(key),
        };
        inst.set_relation(rel.name, stub);
    }
}
