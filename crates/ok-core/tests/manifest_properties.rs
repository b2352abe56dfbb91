//! Property-based tests for manifest validation and port allocation
//! invariants.

use ok_core::plugin::Manifest;
use ok_core::runtime::{PortTable, PORT_RANGE};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;

fn manifest_with(name: &str, port: i64, version: &str) -> Manifest {
    serde_json::from_value(json!({
        "name": name,
        "version": version,
        "risk": "low",
        "permissions": [],
        "docker": { "image": "opskernel/demo:1.0", "port": port }
    }))
    .expect("manifest deserializes")
}

fn has_error(m: &Manifest, path: &str) -> bool {
    m.validation_errors().iter().any(|e| e.path == path)
}

fn valid_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,62}[a-z0-9]"
}

#[derive(Debug, Clone)]
enum PortOp {
    Allocate(u8, Option<u16>),
    Release(u8),
    Reclaim(u8, u16),
}

fn port_op() -> impl Strategy<Value = PortOp> {
    prop_oneof![
        (0u8..12, proptest::option::of(38000u16..38300)).prop_map(|(n, p)| PortOp::Allocate(n, p)),
        (0u8..12).prop_map(PortOp::Release),
        (0u8..12, 38000u16..38300).prop_map(|(n, p)| PortOp::Reclaim(n, p)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn well_formed_names_pass_name_rule(name in valid_name()) {
        let m = manifest_with(&name, 8080, "1.0.0");
        prop_assert!(!has_error(&m, "name"), "rejected {:?}: {:?}", name, m.validation_errors());
    }

    #[test]
    fn names_with_uppercase_or_leading_digit_fail(
        prefix in "[A-Z0-9]",
        rest in "[a-z0-9]{1,20}",
    ) {
        let name = format!("{}{}", prefix, rest);
        let m = manifest_with(&name, 8080, "1.0.0");
        prop_assert!(has_error(&m, "name"));
    }

    #[test]
    fn port_rule_matches_range(port in -1000i64..70000) {
        let m = manifest_with("demo", port, "1.0.0");
        let in_range = (1..=65535).contains(&port);
        prop_assert_eq!(has_error(&m, "docker.port"), !in_range);
        prop_assert_eq!(m.validate().is_ok(), in_range);
    }

    #[test]
    fn content_hash_is_stable_and_version_sensitive(
        name in valid_name(),
        a in "[0-9]\\.[0-9]\\.[0-9]",
        b in "[0-9]\\.[0-9]\\.[0-9]",
    ) {
        let first = manifest_with(&name, 8080, &a);
        let reparsed: Manifest =
            serde_json::from_value(serde_json::to_value(&first).unwrap()).unwrap();
        prop_assert_eq!(first.content_hash(), reparsed.content_hash());
        prop_assert_eq!(first.content_hash().len(), 64);

        let second = manifest_with(&name, 8080, &b);
        prop_assert_eq!(first.content_hash() == second.content_hash(), a == b);
    }

    #[test]
    fn port_table_never_double_books(ops in proptest::collection::vec(port_op(), 1..200)) {
        let mut table = PortTable::new();
        for op in ops {
            match op {
                PortOp::Allocate(n, preferred) => {
                    let name = format!("p{}", n);
                    let before = table.port_of(&name);
                    if let Some(port) = table.allocate(&name, preferred) {
                        prop_assert!(PORT_RANGE.contains(&port));
                        if let Some(before) = before {
                            prop_assert_eq!(before, port, "existing allocation must be kept");
                        }
                    }
                }
                PortOp::Release(n) => {
                    table.release(&format!("p{}", n));
                }
                PortOp::Reclaim(n, port) => {
                    let reclaimed = table.reclaim(&format!("p{}", n), port);
                    if !PORT_RANGE.contains(&port) {
                        prop_assert!(!reclaimed);
                    }
                }
            }

            let allocations = table.allocations();
            let mut owners: BTreeMap<String, u16> = BTreeMap::new();
            for (port, owner) in &allocations {
                prop_assert!(PORT_RANGE.contains(port));
                prop_assert!(owners.insert(owner.clone(), *port).is_none(), "{} holds two ports", owner);
                prop_assert_eq!(table.owner_of(*port), Some(owner.as_str()));
            }
            prop_assert_eq!(table.len(), allocations.len());
        }
    }
}
