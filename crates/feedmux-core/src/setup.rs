//! Channel setup handshake
//!
//! After a link becomes active the reactor walks the channel through an
//! optional handshake before reporting it ready:
//!
//! - `Init` → `LoggedIn` on an accepted login response
//! - `LoggedIn` → `HaveDirectory` on a directory response
//! - `HaveDirectory` → `HaveSchemaPart1` → `HaveSchemaPart2` on the two schema
//!   dictionaries, requested one after the other
//!
//! Stages that the [`SetupPlan`] skips are never entered; the channel becomes
//! `Ready` as soon as the last requested stage completes. Any state may move to
//! `Reconnecting`, which returns to `Init` when a new link comes up.

use serde::{Deserialize, Serialize};

use crate::codec::{LoginRequest, Message, SchemaPart};
use crate::errors::{ConfigError, SetupError};

/// Handshake progress of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelSetupState {
    Init,
    LoggedIn,
    HaveDirectory,
    HaveSchemaPart1,
    HaveSchemaPart2,
    Ready,
    Reconnecting,
}

impl ChannelSetupState {
    /// Structural check, independent of any plan
    pub fn can_transition_to(self, next: ChannelSetupState) -> bool {
        use ChannelSetupState::*;
        match (self, next) {
            (Init, LoggedIn)
            | (LoggedIn, HaveDirectory)
            | (HaveDirectory, HaveSchemaPart1)
            | (HaveSchemaPart1, HaveSchemaPart2) => true,
            (Init | LoggedIn | HaveDirectory | HaveSchemaPart2, Ready) => true,
            (Reconnecting, Init) => true,
            (from, Reconnecting) => from != Reconnecting,
            _ => false,
        }
    }

    pub fn is_ready(self) -> bool {
        self == ChannelSetupState::Ready
    }
}

/// Login parameters sent on the first setup request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginConfig {
    pub user_name: String,
    pub application_name: String,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            user_name: String::from("feedmux"),
            application_name: String::from("feedmux"),
        }
    }
}

/// Which setup stages a channel performs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupPlan {
    pub login: Option<LoginConfig>,
    pub request_directory: bool,
    pub download_schema: bool,
}

/// Result of feeding an inbound message to the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupProgress {
    /// Not a handshake message; deliver it to the application
    NotSetup,
    /// The handshake moved to `state`
    Advanced {
        state: ChannelSetupState,
        /// Next request to write, if another stage follows
        request: Option<Message>,
        /// `state` was the last planned stage
        ready: bool,
    },
}

impl SetupPlan {
    /// No handshake; channels are ready as soon as their link is up
    pub fn none() -> Self {
        Self::default()
    }

    /// Login, directory and both schema parts
    pub fn full(login: LoginConfig) -> Self {
        Self {
            login: Some(login),
            request_directory: true,
            download_schema: true,
        }
    }

    /// Each stage requires the previous one
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.download_schema && !self.request_directory {
            return Err(ConfigError::invalid(
                "schema download requires a directory request",
            ));
        }
        if self.request_directory && self.login.is_none() {
            return Err(ConfigError::invalid("directory request requires a login"));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.login.is_none()
    }

    /// Whether the handshake is finished once `state` is reached
    pub fn completes_at(&self, state: ChannelSetupState) -> bool {
        match state {
            ChannelSetupState::Init => self.login.is_none(),
            ChannelSetupState::LoggedIn => !self.request_directory,
            ChannelSetupState::HaveDirectory => !self.download_schema,
            ChannelSetupState::HaveSchemaPart2 | ChannelSetupState::Ready => true,
            ChannelSetupState::HaveSchemaPart1 | ChannelSetupState::Reconnecting => false,
        }
    }

    /// Request to write when a link comes up, if the plan has a handshake
    pub fn first_request(&self, access_token: Option<&str>) -> Option<Message> {
        self.login.as_ref().map(|login| {
            Message::LoginRequest(LoginRequest {
                user_name: login.user_name.clone(),
                application_name: login.application_name.clone(),
                access_token: access_token.map(str::to_owned),
            })
        })
    }

    /// Feed an inbound message received while in `state`
    pub fn advance(
        &self,
        state: ChannelSetupState,
        message: &Message,
    ) -> Result<SetupProgress, SetupError> {
        use ChannelSetupState::*;

        if matches!(state, Ready | Reconnecting) {
            return Ok(SetupProgress::NotSetup);
        }

        let next = match (state, message) {
            (Init, Message::LoginResponse(response)) if self.login.is_some() => {
                if !response.accepted {
                    return Err(SetupError::LoginRejected {
                        text: response.text.clone(),
                    });
                }
                LoggedIn
            }
            (LoggedIn, Message::DirectoryResponse(_)) if self.request_directory => HaveDirectory,
            (HaveDirectory, Message::SchemaResponse(schema))
                if self.download_schema && schema.part == SchemaPart::Fields =>
            {
                HaveSchemaPart1
            }
            (HaveSchemaPart1, Message::SchemaResponse(schema)) if schema.part == SchemaPart::Enums => {
                HaveSchemaPart2
            }
            (
                _,
                Message::LoginResponse(_) | Message::DirectoryResponse(_) | Message::SchemaResponse(_),
            ) => {
                return Err(SetupError::UnexpectedMessage {
                    state,
                    message: message.kind(),
                })
            }
            _ => return Ok(SetupProgress::NotSetup),
        };

        let ready = self.completes_at(next);
        let request = if ready {
            None
        } else {
            match next {
                LoggedIn => Some(Message::DirectoryRequest),
                HaveDirectory => Some(Message::SchemaRequest(SchemaPart::Fields)),
                HaveSchemaPart1 => Some(Message::SchemaRequest(SchemaPart::Enums)),
                _ => None,
            }
        };

        Ok(SetupProgress::Advanced {
            state: next,
            request,
            ready,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{LoginResponse, Schema, ServiceInfo};

    fn accepted() -> Message {
        Message::LoginResponse(LoginResponse {
            accepted: true,
            text: "welcome".into(),
        })
    }

    fn schema(part: SchemaPart) -> Message {
        Message::SchemaResponse(Schema {
            part,
            name: "dict".into(),
            body: vec![],
        })
    }

    #[test]
    fn test_full_plan_walks_every_stage() {
        let plan = SetupPlan::full(LoginConfig::default());
        assert!(matches!(plan.first_request(None), Some(Message::LoginRequest(_))));

        let step = plan.advance(ChannelSetupState::Init, &accepted()).unwrap();
        assert_eq!(
            step,
            SetupProgress::Advanced {
                state: ChannelSetupState::LoggedIn,
                request: Some(Message::DirectoryRequest),
                ready: false,
            }
        );

        let directory = Message::DirectoryResponse(vec![ServiceInfo {
            service_id: 1,
            name: "ELEKTRON_DD".into(),
        }]);
        let step = plan.advance(ChannelSetupState::LoggedIn, &directory).unwrap();
        assert_eq!(
            step,
            SetupProgress::Advanced {
                state: ChannelSetupState::HaveDirectory,
                request: Some(Message::SchemaRequest(SchemaPart::Fields)),
                ready: false,
            }
        );

        let step = plan
            .advance(ChannelSetupState::HaveDirectory, &schema(SchemaPart::Fields))
            .unwrap();
        assert_eq!(
            step,
            SetupProgress::Advanced {
                state: ChannelSetupState::HaveSchemaPart1,
                request: Some(Message::SchemaRequest(SchemaPart::Enums)),
                ready: false,
            }
        );

        let step = plan
            .advance(ChannelSetupState::HaveSchemaPart1, &schema(SchemaPart::Enums))
            .unwrap();
        assert_eq!(
            step,
            SetupProgress::Advanced {
                state: ChannelSetupState::HaveSchemaPart2,
                request: None,
                ready: true,
            }
        );
    }

    #[test]
    fn test_login_only_plan_is_ready_after_login() {
        let plan = SetupPlan {
            login: Some(LoginConfig::default()),
            ..SetupPlan::default()
        };
        let step = plan.advance(ChannelSetupState::Init, &accepted()).unwrap();
        assert_eq!(
            step,
            SetupProgress::Advanced {
                state: ChannelSetupState::LoggedIn,
                request: None,
                ready: true,
            }
        );
    }

    #[test]
    fn test_empty_plan_completes_immediately() {
        let plan = SetupPlan::none();
        assert!(plan.first_request(Some("token")).is_none());
        assert!(plan.completes_at(ChannelSetupState::Init));
    }

    #[test]
    fn test_login_rejected() {
        let plan = SetupPlan::full(LoginConfig::default());
        let denied = Message::LoginResponse(LoginResponse {
            accepted: false,
            text: "bad user".into(),
        });
        assert_eq!(
            plan.advance(ChannelSetupState::Init, &denied),
            Err(SetupError::LoginRejected {
                text: "bad user".into()
            })
        );
    }

    #[test]
    fn test_out_of_order_schema_rejected() {
        let plan = SetupPlan::full(LoginConfig::default());
        assert!(matches!(
            plan.advance(ChannelSetupState::HaveDirectory, &schema(SchemaPart::Enums)),
            Err(SetupError::UnexpectedMessage { .. })
        ));
    }

    #[test]
    fn test_data_during_setup_is_delivered() {
        let plan = SetupPlan::full(LoginConfig::default());
        assert_eq!(
            plan.advance(ChannelSetupState::LoggedIn, &Message::data(5, vec![1])),
            Ok(SetupProgress::NotSetup)
        );
        assert_eq!(
            plan.advance(ChannelSetupState::Ready, &accepted()),
            Ok(SetupProgress::NotSetup)
        );
    }

    #[test]
    fn test_login_token_is_attached() {
        let plan = SetupPlan::full(LoginConfig::default());
        match plan.first_request(Some("abc")) {
            Some(Message::LoginRequest(request)) => {
                assert_eq!(request.access_token.as_deref(), Some("abc"))
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_plan_validation() {
        let plan = SetupPlan {
            login: Some(LoginConfig::default()),
            request_directory: false,
            download_schema: true,
        };
        assert!(plan.validate().is_err());

        let plan = SetupPlan {
            login: None,
            request_directory: true,
            download_schema: false,
        };
        assert!(plan.validate().is_err());

        assert!(SetupPlan::full(LoginConfig::default()).validate().is_ok());
        assert!(SetupPlan::none().validate().is_ok());
    }

    #[test]
    fn test_structural_transitions() {
        use ChannelSetupState::*;
        assert!(Init.can_transition_to(LoggedIn));
        assert!(HaveSchemaPart2.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Init));
        assert!(!Reconnecting.can_transition_to(Reconnecting));
        assert!(!HaveSchemaPart1.can_transition_to(Ready));
        assert!(!Init.can_transition_to(HaveDirectory));
    }
}
