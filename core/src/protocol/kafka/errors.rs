//! Kafka Error Codes
//!
//! The subset of broker error codes the gateway inspects. Codes it does not
//! know are carried through untouched as raw `i16` values in reset
//! extensions; [`KafkaErrorCode::from_i16`] only classifies them.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum KafkaErrorCode {
    NoError = 0,
    Unknown = -1,
    OffsetOutOfRange = 1,
    CorruptMessage = 2,
    UnknownTopicOrPartition = 3,
    LeaderNotAvailable = 5,
    NotLeaderForPartition = 6,
    RequestTimedOut = 7,
    BrokerNotAvailable = 8,
    MessageTooLarge = 10,
    NetworkException = 13,
    CoordinatorLoadInProgress = 14,
    CoordinatorNotAvailable = 15,
    NotCoordinator = 16,
    NotEnoughReplicas = 19,
    NotEnoughReplicasAfterAppend = 20,
    IllegalGeneration = 22,
    UnknownMemberId = 25,
    RebalanceInProgress = 27,
    TopicAuthorizationFailed = 29,
    GroupAuthorizationFailed = 30,
    ClusterAuthorizationFailed = 31,
    UnsupportedSaslMechanism = 33,
    IllegalSaslState = 34,
    UnsupportedVersion = 35,
    TopicAlreadyExists = 36,
    InvalidConfig = 40,
    NotController = 41,
    InvalidRequest = 42,
    KafkaStorageError = 56,
    SaslAuthenticationFailed = 58,
}

impl KafkaErrorCode {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn as_i32(self) -> i32 {
        self as i16 as i32
    }

    pub fn from_i16(code: i16) -> Self {
        match code {
            0 => Self::NoError,
            1 => Self::OffsetOutOfRange,
            2 => Self::CorruptMessage,
            3 => Self::UnknownTopicOrPartition,
            5 => Self::LeaderNotAvailable,
            6 => Self::NotLeaderForPartition,
            7 => Self::RequestTimedOut,
            8 => Self::BrokerNotAvailable,
            10 => Self::MessageTooLarge,
            13 => Self::NetworkException,
            14 => Self::CoordinatorLoadInProgress,
            15 => Self::CoordinatorNotAvailable,
            16 => Self::NotCoordinator,
            19 => Self::NotEnoughReplicas,
            20 => Self::NotEnoughReplicasAfterAppend,
            22 => Self::IllegalGeneration,
            25 => Self::UnknownMemberId,
            27 => Self::RebalanceInProgress,
            29 => Self::TopicAuthorizationFailed,
            30 => Self::GroupAuthorizationFailed,
            31 => Self::ClusterAuthorizationFailed,
            33 => Self::UnsupportedSaslMechanism,
            34 => Self::IllegalSaslState,
            35 => Self::UnsupportedVersion,
            36 => Self::TopicAlreadyExists,
            40 => Self::InvalidConfig,
            41 => Self::NotController,
            42 => Self::InvalidRequest,
            56 => Self::KafkaStorageError,
            58 => Self::SaslAuthenticationFailed,
            _ => Self::Unknown,
        }
    }

    /// Errors after which a fan reconnects instead of failing its members.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::CorruptMessage
                | Self::UnknownTopicOrPartition
                | Self::LeaderNotAvailable
                | Self::RequestTimedOut
                | Self::NetworkException
                | Self::CoordinatorLoadInProgress
                | Self::CoordinatorNotAvailable
                | Self::NotCoordinator
                | Self::NotEnoughReplicas
                | Self::NotEnoughReplicasAfterAppend
                | Self::KafkaStorageError
        )
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::NoError => "No error",
            Self::Unknown => "Unknown server error",
            Self::OffsetOutOfRange => "Offset out of range",
            Self::CorruptMessage => "Message failed its CRC checksum",
            Self::UnknownTopicOrPartition => "Unknown topic or partition",
            Self::LeaderNotAvailable => "Leader not available",
            Self::NotLeaderForPartition => "Not leader for partition",
            Self::RequestTimedOut => "Request timed out",
            Self::BrokerNotAvailable => "Broker not available",
            Self::MessageTooLarge => "Message too large",
            Self::NetworkException => "Network exception",
            Self::CoordinatorLoadInProgress => "Coordinator load in progress",
            Self::CoordinatorNotAvailable => "Coordinator not available",
            Self::NotCoordinator => "Not coordinator",
            Self::NotEnoughReplicas => "Not enough replicas",
            Self::NotEnoughReplicasAfterAppend => "Not enough replicas after append",
            Self::IllegalGeneration => "Illegal generation",
            Self::UnknownMemberId => "Unknown member id",
            Self::RebalanceInProgress => "Rebalance in progress",
            Self::TopicAuthorizationFailed => "Topic authorization failed",
            Self::GroupAuthorizationFailed => "Group authorization failed",
            Self::ClusterAuthorizationFailed => "Cluster authorization failed",
            Self::UnsupportedSaslMechanism => "Unsupported SASL mechanism",
            Self::IllegalSaslState => "Illegal SASL state",
            Self::UnsupportedVersion => "Unsupported version",
            Self::TopicAlreadyExists => "Topic already exists",
            Self::InvalidConfig => "Invalid config",
            Self::NotController => "Not controller",
            Self::InvalidRequest => "Invalid request",
            Self::KafkaStorageError => "Kafka storage error",
            Self::SaslAuthenticationFailed => "SASL authentication failed",
        }
    }
}

impl Default for KafkaErrorCode {
    fn default() -> Self {
        Self::NoError
    }
}

impl std::fmt::Display for KafkaErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.as_i16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(KafkaErrorCode::NotLeaderForPartition.as_i16(), 6);
        assert_eq!(KafkaErrorCode::SaslAuthenticationFailed.as_i32(), 58);
        assert_eq!(
            KafkaErrorCode::from_i16(35),
            KafkaErrorCode::UnsupportedVersion
        );
        assert_eq!(KafkaErrorCode::from_i16(9999), KafkaErrorCode::Unknown);
    }

    #[test]
    fn test_retriable_errors() {
        assert!(KafkaErrorCode::LeaderNotAvailable.is_retriable());
        assert!(KafkaErrorCode::RequestTimedOut.is_retriable());
        assert!(!KafkaErrorCode::NotLeaderForPartition.is_retriable());
        assert!(!KafkaErrorCode::SaslAuthenticationFailed.is_retriable());
    }

    #[test]
    fn test_error_display() {
        let shown = KafkaErrorCode::TopicAuthorizationFailed.to_string();
        assert_eq!(shown, "Topic authorization failed (29)");
    }
}
