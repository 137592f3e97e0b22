//! Request header names understood by the server.

/// Client token.
pub const TOKEN: &str = "X-Vault-Token";
/// Requested response-wrapping TTL.
pub const WRAP_TTL: &str = "X-Vault-Wrap-TTL";
/// One MFA credential; repeated once per credential.
pub const MFA: &str = "X-Vault-MFA";
/// Ask the server to bypass soft-mandatory policy checks.
pub const POLICY_OVERRIDE: &str = "X-Vault-Policy-Override";
/// Namespace the request is scoped to.
pub const NAMESPACE: &str = "X-Vault-Namespace";
