use anyhow::Result;
use std::collections::BTreeSet;

/// Counts participants with at least one edit on any of `wikis`.
///
/// Wikis are visited in sorted order and each query only asks about
/// participants not yet seen; the walk stops as soon as everyone is retained.
/// The count is the size of the union, so neither the input order nor the early
/// stop changes it.
pub fn count_retained<F>(wikis: &[String], participants: &[String], mut edited_since: F) -> Result<usize>
where
    F: FnMut(&str, &[String]) -> Result<BTreeSet<String>>,
{
    let everyone: BTreeSet<&str> = participants.iter().map(String::as_str).collect();
    let ordered: BTreeSet<&str> = wikis.iter().map(String::as_str).collect();
    let mut retained = BTreeSet::<String>::new();

    for (visited, wiki) in ordered.iter().enumerate() {
        if retained.len() == everyone.len() {
            tracing::debug!(
                skipped = ordered.len() - visited,
                "all participants retained; skipping remaining wikis"
            );
            break;
        }
        let pending = everyone
            .iter()
            .filter(|name| !retained.contains(**name))
            .map(|name| name.to_string())
            .collect::<Vec<_>>();
        for user in edited_since(wiki, &pending)? {
            if everyone.contains(user.as_str()) {
                retained.insert(user);
            }
        }
    }

    Ok(retained.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn names(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    fn fixture() -> BTreeMap<String, BTreeSet<String>> {
        BTreeMap::from([
            ("arwiki".to_string(), BTreeSet::from(["Alice".to_string()])),
            (
                "dewiki".to_string(),
                BTreeSet::from(["Bob".to_string(), "Alice".to_string()]),
            ),
            ("enwiki".to_string(), BTreeSet::from(["Carol".to_string()])),
            ("frwiki".to_string(), BTreeSet::from(["Dave".to_string()])),
        ])
    }

    fn full_scan(per_wiki: &BTreeMap<String, BTreeSet<String>>, participants: &[String]) -> usize {
        per_wiki
            .values()
            .flatten()
            .filter(|u| participants.contains(u))
            .collect::<BTreeSet<_>>()
            .len()
    }

    #[test]
    fn short_circuit_matches_full_scan() {
        let per_wiki = fixture();
        let participants = names(&["Alice", "Bob", "Carol"]);
        let mut queried = Vec::new();
        let count = count_retained(
            &names(&["frwiki", "enwiki", "dewiki", "arwiki"]),
            &participants,
            |wiki, users| {
                queried.push(wiki.to_string());
                Ok(per_wiki[wiki]
                    .iter()
                    .filter(|u| users.contains(u))
                    .cloned()
                    .collect())
            },
        )
        .unwrap();

        assert_eq!(count, full_scan(&per_wiki, &participants));
        assert_eq!(count, 3);
        // arwiki, dewiki and enwiki cover everyone; frwiki is never queried.
        assert_eq!(queried, names(&["arwiki", "dewiki", "enwiki"]));
    }

    #[test]
    fn result_is_independent_of_wiki_order() {
        let per_wiki = fixture();
        let participants = names(&["Alice", "Dave", "Erin"]);
        let orders = [
            names(&["arwiki", "dewiki", "enwiki", "frwiki"]),
            names(&["frwiki", "enwiki", "dewiki", "arwiki"]),
            names(&["dewiki", "frwiki", "arwiki", "enwiki", "dewiki"]),
        ];
        for order in orders {
            let count = count_retained(&order, &participants, |wiki, users| {
                Ok(per_wiki[wiki]
                    .iter()
                    .filter(|u| users.contains(u))
                    .cloned()
                    .collect())
            })
            .unwrap();
            assert_eq!(count, full_scan(&per_wiki, &participants));
            assert_eq!(count, 2);
        }
    }

    #[test]
    fn only_pending_participants_are_queried() {
        let per_wiki = fixture();
        let participants = names(&["Alice", "Bob"]);
        let mut asked = Vec::new();
        count_retained(
            &names(&["arwiki", "dewiki"]),
            &participants,
            |wiki, users| {
                asked.push(users.to_vec());
                Ok(per_wiki[wiki].clone())
            },
        )
        .unwrap();
        assert_eq!(asked, vec![names(&["Alice", "Bob"]), names(&["Bob"])]);
    }

    #[test]
    fn ignores_users_outside_participant_set() {
        let count = count_retained(&names(&["enwiki"]), &names(&["Alice"]), |_, _| {
            Ok(BTreeSet::from(["Mallory".to_string()]))
        })
        .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn query_failure_propagates() {
        let err = count_retained(&names(&["enwiki"]), &names(&["Alice"]), |_, _| {
            anyhow::bail!("replica unreachable")
        })
        .unwrap_err();
        assert!(err.to_string().contains("replica unreachable"));
    }
}
