use rand::Rng;

/// picks a random element, `None` for an empty slice
pub fn pick_random<T>(items: &[T]) -> Option<&T> {
    if items.is_empty() {
        return None;
    }
    let idx = rand::rng().random_range(0..items.len());
    items.get(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_random() {
        let empty: Vec<u32> = vec![];
        assert_eq!(pick_random(&empty), None);
        assert_eq!(pick_random(&[7]), Some(&7));

        let items = [1, 2, 3];
        for _ in 0..100 {
            assert!(items.contains(pick_random(&items).unwrap()));
        }
    }
}
