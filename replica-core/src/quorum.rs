//! Majority arithmetic.

/// Compute the size of a majority for a group of the given size.
pub fn majority_of(len: usize) -> usize {
    (len / 2) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority_of() {
        assert_eq!(majority_of(1), 1);
        assert_eq!(majority_of(2), 2);
        assert_eq!(majority_of(3), 2);
        assert_eq!(majority_of(4), 3);
        assert_eq!(majority_of(5), 3);
    }
}
