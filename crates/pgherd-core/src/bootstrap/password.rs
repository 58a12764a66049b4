// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Owner password generation.

use rand::Rng;
use rand::distributions::Alphanumeric;

/// Length of generated passwords.
pub const PASSWORD_LEN: usize = 32;

/// Random alphanumeric password of [`PASSWORD_LEN`] characters.
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}
