//! Primary 식별자(server_uuid) 추적
//!
//! 연결할 때마다 server_uuid를 조회하고, 기억하고 있던 값과 다르면
//! primary가 바뀐 것(failover)으로 판단합니다.

use crate::connection::PrimaryLink;
use crate::error::Result;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimaryIdentity {
    current: Option<String>,
    previous: Option<String>,
    switched: bool,
}

impl PrimaryIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn previous(&self) -> Option<&str> {
        self.previous.as_deref()
    }

    /// 마지막 `observe` 결과
    pub fn switched(&self) -> bool {
        self.switched
    }

    /// 새로 조회한 uuid 반영. primary가 바뀌었으면 true
    pub fn observe(&mut self, uuid: &str) -> bool {
        let uuid = uuid.trim();
        self.switched = match self.current.as_deref() {
            None => false,
            Some(known) => !known.eq_ignore_ascii_case(uuid),
        };

        if self.switched {
            warn!(
                previous = self.current.as_deref().unwrap_or_default(),
                current = uuid,
                "Primary switched"
            );
            self.previous = self.current.replace(uuid.to_string());
        } else if self.current.is_none() {
            info!(uuid, "Primary identity recorded");
            self.current = Some(uuid.to_string());
        }
        self.switched
    }

    /// primary에 server_uuid를 조회해 반영
    pub async fn refresh<L: PrimaryLink>(&mut self, link: &mut L) -> Result<bool> {
        let uuid = link.server_uuid().await?;
        Ok(self.observe(&uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const B: &str = "4f22ab58-82db-22f2-af44-d91bb0530673";

    #[test]
    fn test_first_observation_is_not_a_switch() {
        let mut identity = PrimaryIdentity::new();
        assert!(!identity.observe(A));
        assert_eq!(identity.current(), Some(A));
        assert_eq!(identity.previous(), None);
    }

    #[test]
    fn test_same_primary() {
        let mut identity = PrimaryIdentity::new();
        identity.observe(A);
        assert!(!identity.observe(&A.to_uppercase()));
        assert!(!identity.switched());
    }

    #[test]
    fn test_switch_rotates_previous() {
        let mut identity = PrimaryIdentity::new();
        identity.observe(A);
        assert!(identity.observe(B));
        assert_eq!(identity.current(), Some(B));
        assert_eq!(identity.previous(), Some(A));

        // 같은 새 primary에 다시 연결하면 더 이상 switch 아님
        assert!(!identity.observe(B));
        assert_eq!(identity.previous(), Some(A));
    }
}
