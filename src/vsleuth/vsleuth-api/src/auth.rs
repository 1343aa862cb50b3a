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

/// An authenticated operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    /// the operator's e-mail, as registered.
    pub email: String,
}

/// The session layer seam: vSleuth only needs to know whether a request
/// belongs to an authenticated operator. Cookie/session mechanics live
/// with the collaborator owning the `auth` database.
pub trait Authenticator: Send + Sync {
    /// The operator behind this request, if any.
    fn authenticated_user(&self, headers: &axum::http::HeaderMap) -> Option<UserIdentity>;
}

/// A minimal authenticator for headless deployments: one shared bearer
/// token, checked against the `Authorization` header. With no token
/// configured, nobody is an operator.
pub struct BearerTokenAuthenticator {
    token: Option<String>,
}

impl BearerTokenAuthenticator {
    /// Accept requests carrying `Authorization: Bearer <token>`.
    #[must_use]
    pub const fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl Authenticator for BearerTokenAuthenticator {
    fn authenticated_user(&self, headers: &axum::http::HeaderMap) -> Option<UserIdentity> {
        let expected = self.token.as_deref()?;

        let presented = headers
            .get(axum::http::header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")?;

        (presented == expected).then(|| UserIdentity {
            email: "operator@localhost".to_string(),
        })
    }
}
