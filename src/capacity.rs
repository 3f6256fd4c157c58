/// Effective guest capacity: base capacity plus every attached amenity's
/// additional capacity. Saturates instead of wrapping.
pub fn total_capacity(base_capacity: u32, additional: impl IntoIterator<Item = u32>) -> u32 {
    additional
        .into_iter()
        .fold(base_capacity, |acc, extra| acc.saturating_add(extra))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_only() {
        assert_eq!(total_capacity(4, []), 4);
    }

    #[test]
    fn amenities_add_up() {
        assert_eq!(total_capacity(4, [2, 1]), 7);
        assert_eq!(total_capacity(4, [2]), 5);
    }

    #[test]
    fn zero_capacity_amenities_change_nothing() {
        assert_eq!(total_capacity(3, [0, 0, 0]), 3);
    }

    #[test]
    fn saturates() {
        assert_eq!(total_capacity(u32::MAX - 1, [5]), u32::MAX);
    }
}
