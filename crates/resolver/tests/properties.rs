use std::collections::BTreeSet;

use proptest::prelude::*;
use verlay_resolver::{parse_version, VersionRange, VersionSet};

fn version_names() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set((0u64..3, 0u64..4, 0u64..6), 1..12).prop_map(|triples| {
        triples
            .into_iter()
            .map(|(major, minor, patch)| format!("v{major}.{minor}.{patch}"))
            .collect()
    })
}

proptest! {
    #[test]
    fn versions_are_the_input_set_strictly_descending(names in version_names()) {
        let set = VersionSet::from_names(names.clone());
        let listed: BTreeSet<&str> = set.versions().iter().map(String::as_str).collect();
        let expected: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        prop_assert_eq!(listed, expected);

        for pair in set.versions().windows(2) {
            let higher = parse_version(&pair[0]).unwrap();
            let lower = parse_version(&pair[1]).unwrap();
            prop_assert!(higher > lower);
        }
    }

    #[test]
    fn find_is_idempotent(names in version_names(), major in 0u64..3, minor in 0u64..4) {
        let set = VersionSet::from_names(names);
        let spec = format!("~{major}.{minor}");
        prop_assert_eq!(set.find(Some(spec.as_str())), set.find(Some(spec.as_str())));
    }

    #[test]
    fn tightening_a_range_never_widens_the_match(
        names in version_names(),
        floor in (0u64..3, 0u64..4, 0u64..6),
        ceiling in (0u64..3, 0u64..4, 0u64..6),
    ) {
        let set = VersionSet::from_names(names);
        let loose = VersionRange::parse(&format!(">={}.{}.{}", floor.0, floor.1, floor.2)).unwrap();
        let tight = VersionRange::parse(&format!(
            ">={}.{}.{}, <{}.{}.{}",
            floor.0, floor.1, floor.2, ceiling.0, ceiling.1, ceiling.2
        ))
        .unwrap();

        if let Some(found) = set.find_in(&tight) {
            prop_assert!(loose.matches_name(found));
            let loose_best = set.find_in(&loose).unwrap();
            prop_assert!(parse_version(loose_best).unwrap() >= parse_version(found).unwrap());
        }
    }

    #[test]
    fn spaces_and_commas_join_comparators_alike(
        names in version_names(),
        floor in (0u64..3, 0u64..4, 0u64..6),
        ceiling in (0u64..3, 0u64..4, 0u64..6),
    ) {
        let set = VersionSet::from_names(names);
        let low = format!("{}.{}.{}", floor.0, floor.1, floor.2);
        let high = format!("{}.{}.{}", ceiling.0, ceiling.1, ceiling.2);
        let spaced = format!(">={low} <={high}");
        let commas = format!(">={low}, <={high}");
        let hyphen = format!("{low} - {high}");
        prop_assert_eq!(set.find(Some(spaced.as_str())), set.find(Some(commas.as_str())));
        prop_assert_eq!(set.find(Some(hyphen.as_str())), set.find(Some(commas.as_str())));
    }
}
