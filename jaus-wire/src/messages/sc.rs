use crate::codec::{codes, MessageBody};
use crate::error::WireError;
use crate::stream::Stream;

/// Requests a service connection for `message_code` from a provider.
///
/// `periodic_rate` is in hundredths of a hertz. The presence vector names
/// which optional fields of the carried message the subscriber wants and is
/// part of the SC key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateServiceConnection {
    pub message_code: u16,
    pub periodic_rate: u16,
    pub presence_vector: u32,
}

impl MessageBody for CreateServiceConnection {
    const CODE: u16 = codes::CREATE_SERVICE_CONNECTION;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u16(self.message_code);
        stream.write_u16(self.periodic_rate);
        stream.write_u32(self.presence_vector);
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        Ok(Self {
            message_code: stream.read_u16()?,
            periodic_rate: stream.read_u16()?,
            presence_vector: stream.read_u32()?,
        })
    }
}

/// Provider's answer to a create request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ScResponseCode {
    #[default]
    CreatedSuccessfully = 0,
    Refused = 1,
    InvalidRate = 2,
    AlreadyExists = 3,
}

impl ScResponseCode {
    fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(ScResponseCode::CreatedSuccessfully),
            1 => Ok(ScResponseCode::Refused),
            2 => Ok(ScResponseCode::InvalidRate),
            3 => Ok(ScResponseCode::AlreadyExists),
            _ => Err(WireError::BadPacket("SC response code out of range")),
        }
    }
}

/// Confirms (or refuses) a service connection. On success the provider's
/// one-byte `instance_id` identifies this SC in all further traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfirmServiceConnection {
    pub message_code: u16,
    pub instance_id: u8,
    pub confirmed_rate: u16,
    pub response: ScResponseCode,
}

impl MessageBody for ConfirmServiceConnection {
    const CODE: u16 = codes::CONFIRM_SERVICE_CONNECTION;

    fn write_body(&self, stream: &mut Stream) {
        stream.write_u16(self.message_code);
        stream.write_u8(self.instance_id);
        stream.write_u16(self.confirmed_rate);
        stream.write_u8(self.response as u8);
    }

    fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
        Ok(Self {
            message_code: stream.read_u16()?,
            instance_id: stream.read_u8()?,
            confirmed_rate: stream.read_u16()?,
            response: ScResponseCode::from_u8(stream.read_u8()?)?,
        })
    }
}

macro_rules! sc_lifecycle_body {
    ($name:ident, $code:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name {
            pub message_code: u16,
            pub instance_id: u8,
        }

        impl MessageBody for $name {
            const CODE: u16 = $code;

            fn write_body(&self, stream: &mut Stream) {
                stream.write_u16(self.message_code);
                stream.write_u8(self.instance_id);
            }

            fn read_body(stream: &mut Stream) -> Result<Self, WireError> {
                Ok(Self {
                    message_code: stream.read_u16()?,
                    instance_id: stream.read_u8()?,
                })
            }
        }
    };
}

sc_lifecycle_body!(
    ActivateServiceConnection,
    codes::ACTIVATE_SERVICE_CONNECTION,
    "Resumes a suspended service connection."
);
sc_lifecycle_body!(
    SuspendServiceConnection,
    codes::SUSPEND_SERVICE_CONNECTION,
    "Pauses a service connection without tearing it down."
);
sc_lifecycle_body!(
    TerminateServiceConnection,
    codes::TERMINATE_SERVICE_CONNECTION,
    "Ends a subscriber's or commander's participation in a service connection."
);
