#![forbid(unsafe_code)]

//! Proptest generators for host value graphs.
//!
//! A [`ValuePlan`] is a buildable description of a host graph: scalars,
//! objects with (possibly read-only) properties, lists, commands.
//! [`ValuePlan::realize`] turns it into live stubs from [`crate::host`].
//! Plans are plain data, so a shrunk counterexample prints as the graph
//! shape that broke the property.

use proptest::collection::vec;
use proptest::prelude::*;

use tain_core::{HostValue, ScalarValue};

use crate::host::{StubCommand, StubList, StubObject};

/// Buildable description of one host value.
#[derive(Debug, Clone)]
pub enum ValuePlan {
    Scalar(ScalarValue),
    Object { props: Vec<(String, bool, ValuePlan)> },
    List(Vec<ValuePlan>),
    Command { enabled: bool },
}

impl ValuePlan {
    /// Build the described value out of live stubs.
    #[must_use]
    pub fn realize(&self) -> HostValue {
        match self {
            Self::Scalar(s) => HostValue::Scalar(s.clone()),
            Self::Object { props } => {
                let obj = StubObject::new();
                for (name, read_only, plan) in props {
                    if *read_only {
                        obj.insert_ro(name.clone(), plan.realize());
                    } else {
                        obj.insert_rw(name.clone(), plan.realize());
                    }
                }
                obj.as_value()
            }
            Self::List(items) => {
                let list = StubList::new();
                for plan in items {
                    list.push(plan.realize());
                }
                list.as_value()
            }
            Self::Command { enabled } => {
                let cmd = StubCommand::new();
                cmd.set_enabled(*enabled);
                cmd.as_value()
            }
        }
    }

    /// Number of composite nodes (objects, lists, commands) the realized
    /// graph will contain. The mirror tracks exactly these.
    #[must_use]
    pub fn composite_count(&self) -> usize {
        match self {
            Self::Scalar(_) => 0,
            Self::Command { .. } => 1,
            Self::Object { props } => {
                1 + props.iter().map(|(_, _, p)| p.composite_count()).sum::<usize>()
            }
            Self::List(items) => 1 + items.iter().map(Self::composite_count).sum::<usize>(),
        }
    }
}

/// Any scalar. Floats stay finite so value equality is well defined on
/// both sides of the mirror.
pub fn scalar_value() -> impl Strategy<Value = ScalarValue> {
    prop_oneof![
        Just(ScalarValue::Null),
        any::<bool>().prop_map(ScalarValue::Bool),
        any::<i64>().prop_map(ScalarValue::Int),
        (-1.0e9..1.0e9f64).prop_map(ScalarValue::Float),
        "[a-z]{0,8}".prop_map(ScalarValue::Str),
    ]
}

/// A whole graph plan up to `depth` levels of nesting. Property names
/// within an object are deduplicated, first occurrence wins.
pub fn value_plan(depth: u32) -> impl Strategy<Value = ValuePlan> {
    let leaf = prop_oneof![
        4 => scalar_value().prop_map(ValuePlan::Scalar),
        1 => any::<bool>().prop_map(|enabled| ValuePlan::Command { enabled }),
    ];
    leaf.prop_recursive(depth, 24, 4, |inner| {
        prop_oneof![
            vec(("[a-z]{1,6}", any::<bool>(), inner.clone()), 0..4).prop_map(|raw| {
                let mut props: Vec<(String, bool, ValuePlan)> = Vec::new();
                for (name, read_only, plan) in raw {
                    if !props.iter().any(|(n, _, _)| *n == name) {
                        props.push((name, read_only, plan));
                    }
                }
                ValuePlan::Object { props }
            }),
            vec(inner, 0..4).prop_map(ValuePlan::List),
        ]
    })
}

/// A plan that is guaranteed to realize as an object root.
pub fn object_plan(depth: u32) -> impl Strategy<Value = ValuePlan> {
    vec(("[a-z]{1,6}", any::<bool>(), value_plan(depth)), 0..4).prop_map(|raw| {
        let mut props: Vec<(String, bool, ValuePlan)> = Vec::new();
        for (name, read_only, plan) in raw {
            if !props.iter().any(|(n, _, _)| *n == name) {
                props.push((name, read_only, plan));
            }
        }
        ValuePlan::Object { props }
    })
}
