// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

/// Number of slots in one Solana epoch.
pub const EPOCH_LENGTH: u64 = 432_000;

/// The epoch a slot belongs to.
pub const fn epoch_of_slot(slot: u64) -> u64 {
    slot / EPOCH_LENGTH
}

/// First slot of an epoch.
pub const fn first_slot_of_epoch(epoch: u64) -> u64 {
    epoch * EPOCH_LENGTH
}

/// Last slot of an epoch (inclusive).
pub const fn last_slot_of_epoch(epoch: u64) -> u64 {
    (epoch + 1) * EPOCH_LENGTH - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_to_epoch_division() {
        assert_eq!(epoch_of_slot(0), 0);
        assert_eq!(epoch_of_slot(431_999), 0);
        assert_eq!(epoch_of_slot(432_000), 1);
        assert_eq!(epoch_of_slot(10 * EPOCH_LENGTH + 5), 10);
        assert_eq!(first_slot_of_epoch(2), 864_000);
        assert_eq!(last_slot_of_epoch(1), 863_999);
    }
}
