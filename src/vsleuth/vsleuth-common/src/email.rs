/*
 * vSleuth mail log forensics
 * Copyright (C) 2022 viridIT SAS
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

/// Split a possibly partial address into `(local_part, domain)`.
///
/// Search inputs may be a full address (`alice@example.com`), a bare
/// local part (`alice`), a bare domain (`example.com`) or empty. A bare
/// token is read as a domain when it contains a dot, as a local part
/// otherwise. Empty components mean "any".
#[must_use]
pub fn split_partial(address: &str) -> (String, String) {
    let address = address.trim();

    if address.is_empty() {
        return (String::new(), String::new());
    }

    match address.split_once('@') {
        Some((local, domain)) => (local.to_lowercase(), domain.to_lowercase()),
        None if address.contains('.') => (String::new(), address.to_lowercase()),
        None => (address.to_lowercase(), String::new()),
    }
}

/// Does the input name one exact mailbox (non-empty local part and
/// domain)? The detective end-user policy only accepts those.
#[must_use]
pub fn is_exact_address(address: &str) -> bool {
    let (local, domain) = split_partial(address);
    !local.is_empty() && !domain.is_empty()
}
