//! Vector, zip and matrix combination.
//!
//! Every vector variable of an experiment template ends up in exactly one
//! group: a matrix (cross product), a zip not consumed by a matrix, or an
//! implicit group of its own. Groups of equal length are then joined
//! positionally, so the number of generated assignments is that length.

use std::collections::{BTreeMap, BTreeSet};

use bench_core::CombinatorError;

pub type Assignment = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixSpec {
    pub name: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct CombinatorInput<'a> {
    pub experiment: &'a str,
    pub vectors: &'a BTreeMap<String, Vec<String>>,
    pub scalars: &'a BTreeSet<String>,
    pub zips: &'a BTreeMap<String, Vec<String>>,
    pub matrices: &'a [MatrixSpec],
}

type Rows = Vec<Vec<(String, String)>>;

struct Group {
    name: String,
    rows: Rows,
}

impl<'a> CombinatorInput<'a> {
    fn member_error(&self, group: &str, member: &str) -> CombinatorError {
        if self.scalars.contains(member) {
            CombinatorError::NotAVector {
                experiment: self.experiment.to_string(),
                group: group.to_string(),
                member: member.to_string(),
            }
        } else {
            CombinatorError::UndeclaredMember {
                experiment: self.experiment.to_string(),
                group: group.to_string(),
                member: member.to_string(),
            }
        }
    }

    fn vector_rows(&self, name: &str) -> Rows {
        self.vectors
            .get(name)
            .map(|values| {
                values
                    .iter()
                    .map(|v| vec![(name.to_string(), v.clone())])
                    .collect()
            })
            .unwrap_or_default()
    }

    fn zip_rows(&self, zip: &str, members: &[String]) -> Result<Rows, CombinatorError> {
        let mut lengths = Vec::new();
        for member in members {
            match self.vectors.get(member) {
                Some(values) => lengths.push((member.clone(), values.len())),
                None => return Err(self.member_error(zip, member)),
            }
        }
        let len = lengths.first().map(|(_, l)| *l).unwrap_or(0);
        if lengths.iter().any(|(_, l)| *l != len) {
            return Err(CombinatorError::ZipLengthMismatch {
                experiment: self.experiment.to_string(),
                zip: zip.to_string(),
                lengths,
            });
        }
        Ok((0..len)
            .map(|idx| {
                members
                    .iter()
                    .map(|m| (m.clone(), self.vectors[m][idx].clone()))
                    .collect()
            })
            .collect())
    }
}

/// Cross product of `parts`, first part varying slowest.
fn cross(parts: &[Rows]) -> Rows {
    let mut out: Rows = vec![Vec::new()];
    for part in parts {
        let mut next = Vec::with_capacity(out.len() * part.len());
        for prefix in &out {
            for row in part {
                let mut combined = prefix.clone();
                combined.extend(row.iter().cloned());
                next.push(combined);
            }
        }
        out = next;
    }
    out
}

pub fn combine(input: &CombinatorInput<'_>) -> Result<Vec<Assignment>, CombinatorError> {
    for (name, values) in input.vectors {
        if values.is_empty() {
            return Err(CombinatorError::EmptyVector {
                experiment: input.experiment.to_string(),
                variable: name.clone(),
            });
        }
    }

    // Which groups claim each variable or zip.
    let mut consumers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (zip, members) in input.zips {
        for member in members {
            consumers.entry(member.clone()).or_default().push(zip.clone());
        }
    }
    for matrix in input.matrices {
        for member in &matrix.members {
            consumers
                .entry(member.clone())
                .or_default()
                .push(matrix.name.clone());
        }
    }
    for (variable, groups) in &consumers {
        if groups.len() > 1 {
            return Err(CombinatorError::AmbiguousConsumption {
                experiment: input.experiment.to_string(),
                variable: variable.clone(),
                groups: groups.clone(),
            });
        }
    }

    let mut zip_rows = BTreeMap::new();
    for (zip, members) in input.zips {
        zip_rows.insert(zip.clone(), input.zip_rows(zip, members)?);
    }

    let mut groups = Vec::new();
    for matrix in input.matrices {
        let mut parts = Vec::new();
        for member in &matrix.members {
            if let Some(rows) = zip_rows.get(member) {
                parts.push(rows.clone());
            } else if input.vectors.contains_key(member) {
                parts.push(input.vector_rows(member));
            } else {
                return Err(input.member_error(&matrix.name, member));
            }
        }
        groups.push(Group {
            name: matrix.name.clone(),
            rows: cross(&parts),
        });
    }
    for (zip, rows) in zip_rows {
        if !consumers.contains_key(&zip) {
            groups.push(Group { name: zip, rows });
        }
    }
    for name in input.vectors.keys() {
        if !consumers.contains_key(name) {
            groups.push(Group {
                name: name.clone(),
                rows: input.vector_rows(name),
            });
        }
    }

    let Some(len) = groups.first().map(|g| g.rows.len()) else {
        return Ok(vec![Assignment::new()]);
    };
    if groups.iter().any(|g| g.rows.len() != len) {
        return Err(CombinatorError::LengthMismatch {
            experiment: input.experiment.to_string(),
            lengths: groups
                .iter()
                .map(|g| (g.name.clone(), g.rows.len()))
                .collect(),
        });
    }
    Ok((0..len)
        .map(|idx| {
            groups
                .iter()
                .flat_map(|g| g.rows[idx].iter().cloned())
                .collect()
        })
        .collect())
}

/// True when every key of some excluded assignment has the same value in
/// the candidate, as reported by `value_of`.
pub fn matches_any<E>(
    excluded: &[Assignment],
    mut value_of: impl FnMut(&str) -> Result<Option<String>, E>,
    mut excluded_value: impl FnMut(&str) -> Result<String, E>,
) -> Result<bool, E> {
    'outer: for exclusion in excluded {
        if exclusion.is_empty() {
            continue;
        }
        for (name, raw) in exclusion {
            let expected = excluded_value(raw)?;
            match value_of(name)? {
                Some(actual) if actual == expected => {}
                _ => continue 'outer,
            }
        }
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vectors(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(name, values)| {
                (
                    name.to_string(),
                    values.iter().map(|v| v.to_string()).collect(),
                )
            })
            .collect()
    }

    fn zips(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        vectors(pairs)
    }

    fn matrix(name: &str, members: &[&str]) -> MatrixSpec {
        MatrixSpec {
            name: name.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn run(
        vecs: &BTreeMap<String, Vec<String>>,
        zips: &BTreeMap<String, Vec<String>>,
        matrices: &[MatrixSpec],
    ) -> Result<Vec<Assignment>, CombinatorError> {
        let scalars = BTreeSet::from(["processes_per_node".to_string()]);
        combine(&CombinatorInput {
            experiment: "app.wl.exp",
            vectors: vecs,
            scalars: &scalars,
            zips,
            matrices,
        })
    }

    fn pick(assignments: &[Assignment], name: &str) -> Vec<String> {
        assignments.iter().map(|a| a[name].clone()).collect()
    }

    #[test]
    fn zip_inside_matrix_yields_zip_length() {
        let vecs = vectors(&[("n_nodes", &["1", "2"]), ("platform", &["p1", "p2"])]);
        let z = zips(&[("platform_config", &["n_nodes", "platform"])]);
        let out = run(&vecs, &z, &[matrix("matrix_0", &["platform_config"])]).expect("combine");
        assert_eq!(out.len(), 2);
        assert_eq!(pick(&out, "n_nodes"), vec!["1", "2"]);
        assert_eq!(pick(&out, "platform"), vec!["p1", "p2"]);
    }

    #[test]
    fn matrices_of_equal_size_join_positionally() {
        let vecs = vectors(&[
            ("a", &["a1", "a2"]),
            ("b", &["b1", "b2"]),
            ("c", &["c1"]),
            ("d", &["d1", "d2", "d3", "d4"]),
        ]);
        let out = run(
            &vecs,
            &BTreeMap::new(),
            &[matrix("m0", &["a", "b"]), matrix("m1", &["c", "d"])],
        )
        .expect("combine");
        assert_eq!(out.len(), 4);
        assert_eq!(pick(&out, "a"), vec!["a1", "a1", "a2", "a2"]);
        assert_eq!(pick(&out, "b"), vec!["b1", "b2", "b1", "b2"]);
        assert_eq!(pick(&out, "d"), vec!["d1", "d2", "d3", "d4"]);
        assert_eq!(pick(&out, "c"), vec!["c1"; 4]);
    }

    #[test]
    fn unconsumed_vectors_zip_implicitly() {
        let vecs = vectors(&[("x", &["1", "2", "3"]), ("y", &["a", "b", "c"])]);
        let out = run(&vecs, &BTreeMap::new(), &[]).expect("combine");
        assert_eq!(pick(&out, "y"), vec!["a", "b", "c"]);

        let vecs = vectors(&[("x", &["1", "2"]), ("y", &["a", "b", "c"])]);
        match run(&vecs, &BTreeMap::new(), &[]).expect_err("mismatch") {
            CombinatorError::LengthMismatch { lengths, .. } => {
                assert_eq!(lengths, vec![("x".into(), 2), ("y".into(), 3)])
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn matrix_and_leftover_vector_mismatch() {
        let vecs = vectors(&[("a", &["1", "2"]), ("b", &["1", "2"]), ("n", &["1", "2"])]);
        let err = run(&vecs, &BTreeMap::new(), &[matrix("matrix_0", &["a", "b"])])
            .expect_err("4 vs 2");
        assert!(matches!(err, CombinatorError::LengthMismatch { .. }));
    }

    #[test]
    fn scalars_without_vectors_give_one_assignment() {
        let out = run(&BTreeMap::new(), &BTreeMap::new(), &[]).expect("combine");
        assert_eq!(out, vec![Assignment::new()]);
    }

    #[test]
    fn group_membership_errors() {
        let vecs = vectors(&[("a", &["1", "2"]), ("b", &["1"])]);
        assert!(matches!(
            run(&vecs, &zips(&[("z", &["a", "b"])]), &[]),
            Err(CombinatorError::ZipLengthMismatch { .. })
        ));
        assert!(matches!(
            run(&vecs, &BTreeMap::new(), &[matrix("m", &["missing"])]),
            Err(CombinatorError::UndeclaredMember { .. })
        ));
        assert!(matches!(
            run(&vecs, &BTreeMap::new(), &[matrix("m", &["processes_per_node"])]),
            Err(CombinatorError::NotAVector { .. })
        ));
        assert!(matches!(
            run(
                &vecs,
                &BTreeMap::new(),
                &[matrix("m0", &["a"]), matrix("m1", &["a", "b"])]
            ),
            Err(CombinatorError::AmbiguousConsumption { .. })
        ));
        let empty = vectors(&[("a", &[])]);
        assert!(matches!(
            run(&empty, &BTreeMap::new(), &[]),
            Err(CombinatorError::EmptyVector { .. })
        ));
    }

    #[test]
    fn exclusion_requires_every_key_to_match() {
        let excluded = vec![Assignment::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "x".to_string()),
        ])];
        let candidate = Assignment::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "y".to_string()),
        ]);
        let hit = matches_any::<()>(
            &excluded,
            |name| Ok(candidate.get(name).cloned()),
            |raw| Ok(raw.to_string()),
        )
        .expect("match");
        assert!(!hit);
        let candidate = Assignment::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "x".to_string()),
        ]);
        let hit = matches_any::<()>(
            &excluded,
            |name| Ok(candidate.get(name).cloned()),
            |raw| Ok(raw.to_string()),
        )
        .expect("match");
        assert!(hit);
    }
}
