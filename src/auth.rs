use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// What a session may do, decided by the user name it logged in with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Anonymous intake: create pending bookings and read availability.
    Public,
    Staff,
}

impl Role {
    pub fn for_user(user: Option<&str>, public_user: &str) -> Self {
        match user {
            Some(u) if u == public_user => Role::Public,
            _ => Role::Staff,
        }
    }
}

/// Two passwords: one for the public intake user, one shared by staff.
#[derive(Debug)]
pub struct SlotkeepAuthSource {
    staff_password: String,
    public_user: String,
    public_password: String,
}

impl SlotkeepAuthSource {
    pub fn new(staff_password: String, public_user: String, public_password: String) -> Self {
        Self {
            staff_password,
            public_user,
            public_password,
        }
    }

    fn password_for(&self, user: Option<&str>) -> &str {
        match Role::for_user(user, &self.public_user) {
            Role::Public => &self.public_password,
            Role::Staff => &self.staff_password,
        }
    }
}

#[async_trait]
impl AuthSource for SlotkeepAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let expected = self.password_for(login.user().as_deref());
        Ok(Password::new(None, expected.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_by_user_name() {
        assert_eq!(Role::for_user(Some("public"), "public"), Role::Public);
        assert_eq!(Role::for_user(Some("frontdesk"), "public"), Role::Staff);
        assert_eq!(Role::for_user(None, "public"), Role::Staff);
    }

    #[test]
    fn password_follows_role() {
        let source = SlotkeepAuthSource::new("staff-pw".into(), "intake".into(), "intake-pw".into());
        assert_eq!(source.password_for(Some("intake")), "intake-pw");
        assert_eq!(source.password_for(Some("alice")), "staff-pw");
    }
}
