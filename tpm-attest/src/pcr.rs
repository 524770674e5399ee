// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Choosing which PCRs to quote when banks disagree

use tpm_types::{HashAlgorithm, PcrBanks};

/// Highest PCR index representable in the selection mask
const MASK_BITS: u32 = 32;

/// Indices present in every non-empty bank, ascending. Empty banks are left
/// out so a disabled bank cannot empty the selection; indices at or above
/// 32 are ignored.
pub fn reconcile(banks: &PcrBanks) -> Vec<u32> {
    let mask = banks
        .values()
        .filter(|bank| !bank.is_empty())
        .map(|bank| {
            bank.keys()
                .filter(|&&index| index < MASK_BITS)
                .fold(0u32, |mask, index| mask | (1 << index))
        })
        .reduce(|acc, mask| acc & mask)
        .unwrap_or(0);

    (0..MASK_BITS).filter(|i| mask & (1 << i) != 0).collect()
}

/// Banks that hold at least one value, in bank order
pub fn quotable_banks(banks: &PcrBanks) -> Vec<HashAlgorithm> {
    banks
        .iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(&alg, _)| alg)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn bank(indices: impl IntoIterator<Item = u32>) -> BTreeMap<u32, Vec<u8>> {
        indices.into_iter().map(|i| (i, vec![0u8; 32])).collect()
    }

    #[test]
    fn test_only_sha256_populated() {
        let banks = PcrBanks::from([
            (HashAlgorithm::Sha1, bank([])),
            (HashAlgorithm::Sha256, bank(0..=5)),
        ]);
        assert_eq!(reconcile(&banks), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(quotable_banks(&banks), vec![HashAlgorithm::Sha256]);
    }

    #[test]
    fn test_only_sha1_populated() {
        let banks = PcrBanks::from([
            (HashAlgorithm::Sha1, bank(0..=5)),
            (HashAlgorithm::Sha256, bank([])),
        ]);
        assert_eq!(reconcile(&banks), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(quotable_banks(&banks), vec![HashAlgorithm::Sha1]);
    }

    #[test]
    fn test_both_banks_populated() {
        let banks = PcrBanks::from([
            (HashAlgorithm::Sha1, bank(0..=5)),
            (HashAlgorithm::Sha256, bank(0..=5)),
        ]);
        assert_eq!(reconcile(&banks), vec![0, 1, 2, 3, 4, 5]);
        let quotable = quotable_banks(&banks);
        assert_eq!(quotable, vec![HashAlgorithm::Sha1, HashAlgorithm::Sha256]);
        assert_eq!(quotable.iter().max(), Some(&HashAlgorithm::Sha256));
    }

    #[test]
    fn test_disjoint_ranges_intersect() {
        let banks = PcrBanks::from([
            (HashAlgorithm::Sha1, bank([2, 3, 4, 5])),
            (HashAlgorithm::Sha256, bank([0, 1, 2, 3])),
        ]);
        assert_eq!(reconcile(&banks), vec![2, 3]);
    }

    #[test]
    fn test_intersection() {
        let banks = PcrBanks::from([
            (HashAlgorithm::Sha1, bank([0, 1, 2, 3])),
            (HashAlgorithm::Sha256, bank([1, 2, 3, 4])),
        ]);
        assert_eq!(reconcile(&banks), vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_bank_is_ignored() {
        let banks = PcrBanks::from([
            (HashAlgorithm::Sha1, bank([])),
            (HashAlgorithm::Sha256, bank(0..24)),
        ]);
        assert_eq!(reconcile(&banks), (0..24).collect::<Vec<_>>());
        assert_eq!(quotable_banks(&banks), vec![HashAlgorithm::Sha256]);
    }

    #[test]
    fn test_nothing_populated() {
        assert!(reconcile(&PcrBanks::new()).is_empty());
        let banks = PcrBanks::from([(HashAlgorithm::Sha1, bank([]))]);
        assert!(reconcile(&banks).is_empty());
        assert!(quotable_banks(&banks).is_empty());
    }

    #[test]
    fn test_high_indices_ignored() {
        let banks = PcrBanks::from([(HashAlgorithm::Sha256, bank([0, 31, 32, 40]))]);
        assert_eq!(reconcile(&banks), vec![0, 31]);
    }

    #[test]
    fn test_result_is_subset_of_every_bank() {
        let banks = PcrBanks::from([
            (HashAlgorithm::Sha1, bank([0, 2, 4, 6, 8, 10])),
            (HashAlgorithm::Sha256, bank([0, 1, 2, 3, 4, 5, 6])),
            (HashAlgorithm::Sha384, bank([2, 4, 6, 7])),
        ]);
        let indices = reconcile(&banks);
        assert_eq!(indices, vec![2, 4, 6]);
        for values in banks.values() {
            assert!(indices.iter().all(|i| values.contains_key(i)));
        }
    }
}
