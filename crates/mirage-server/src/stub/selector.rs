//! Resolves ties among matching stubs.

use super::types::Stub;

/// Picks the stub with the highest priority: stubs are ordered stably by
/// (weight, id) and the last one wins, so higher weight dominates and ties
/// break in favor of the most recently created stub. The result is a deep
/// clone so downstream mutation never reaches the cached original.
pub fn select_stub(mut stubs: Vec<Stub>) -> Option<Stub> {
    if stubs.is_empty() {
        return None;
    }

    stubs.sort_by(|a, b| a.weight.cmp(&b.weight).then(a.id.cmp(&b.id)));
    stubs.pop()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(id: i64, weight: i32) -> Stub {
        Stub::new().with_id(id).with_weight(weight)
    }

    #[test]
    fn test_select_highest_weight() {
        let selected = select_stub(vec![stub(3, 1), stub(2, 3), stub(1, 2)]).unwrap();
        assert_eq!(selected.id, 2);
    }

    #[test]
    fn test_select_latest_id_on_tie() {
        let selected = select_stub(vec![stub(1, 0), stub(3, 0), stub(2, 0)]).unwrap();
        assert_eq!(selected.id, 3);
    }

    #[test]
    fn test_select_is_permutation_invariant() {
        let stubs = vec![stub(3, 1), stub(2, 3), stub(1, 2), stub(4, 3)];

        let mut rotations = Vec::new();
        for i in 0..stubs.len() {
            let mut rotated = stubs.clone();
            rotated.rotate_left(i);
            rotations.push(select_stub(rotated).unwrap().id);
        }

        assert!(rotations.iter().all(|id| *id == rotations[0]));
        assert_eq!(rotations[0], 4);
    }

    #[test]
    fn test_select_empty() {
        assert!(select_stub(Vec::new()).is_none());
    }
}
