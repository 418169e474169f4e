use canopy_core::UserId;

/// Identity of the caller, taken from the `x-user-id` header.
///
/// Authentication happens upstream (gateway); this service only needs to
/// know who started a run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UserContext {
    user_id: UserId,
}

impl UserContext {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}
