use alloc::format;
use alloc::string::String;

/// The last topic level on which a device publishes its sensor readings.
pub const SENSORS_SUFFIX: &str = "sensors";

/// The last topic level on which a device publishes its data and
/// acknowledgements.
pub const DATA_SUFFIX: &str = "data";

/// The topic level separating a command topic from a reply identifier.
pub const RESPONSE_SEGMENT: &str = "ok";

const SEPARATOR: char = '/';

// Wildcard matching a single topic level.
const SINGLE_LEVEL_WILDCARD: &str = "+";
// Wildcard matching all remaining topic levels.
const MULTI_LEVEL_WILDCARD: &str = "#";

/// Builds the command topic `/{device_id}/{action}`.
#[must_use]
#[inline]
pub fn request(device_id: &str, action: &str) -> String {
    format!("/{device_id}/{action}")
}

/// Builds the sensor readings topic `/{device_id}/sensors`.
#[must_use]
#[inline]
pub fn sensors(device_id: &str) -> String {
    format!("/{device_id}/{SENSORS_SUFFIX}")
}

/// Builds the device data topic `/{device_id}/data`.
#[must_use]
#[inline]
pub fn data(device_id: &str) -> String {
    format!("/{device_id}/{DATA_SUFFIX}")
}

/// Builds the response topic `{request_topic}/ok/{call_id}`.
///
/// A distinct `call_id` for each call keeps the replies to concurrent
/// commands sent on the same request topic apart.
#[must_use]
#[inline]
pub fn response(request_topic: &str, call_id: &str) -> String {
    format!("{request_topic}/{RESPONSE_SEGMENT}/{call_id}")
}

/// The shape of a topic exchanged with a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTopic<'a> {
    /// Sensor readings of the contained device.
    Sensors(&'a str),
    /// Data and acknowledgements of the contained device.
    Data(&'a str),
    /// A reply to a command published on the `request` topic.
    Response {
        /// The command topic.
        request: &'a str,
        /// The call identifier.
        call_id: &'a str,
    },
    /// Any other topic.
    Other,
}

impl<'a> DeviceTopic<'a> {
    /// Classifies a topic by its shape.
    #[must_use]
    pub fn classify(topic: &'a str) -> Self {
        if let Some(device_id) = device_with_suffix(topic, SENSORS_SUFFIX) {
            return Self::Sensors(device_id);
        }

        if let Some(device_id) = device_with_suffix(topic, DATA_SUFFIX) {
            return Self::Data(device_id);
        }

        if let Some((prefix, call_id)) = topic.rsplit_once(SEPARATOR)
            && !call_id.is_empty()
            && let Some(request) = prefix
                .strip_suffix(RESPONSE_SEGMENT)
                .and_then(|request| request.strip_suffix(SEPARATOR))
            && !request.is_empty()
        {
            return Self::Response { request, call_id };
        }

        Self::Other
    }

    /// Returns the device identifier embedded in the topic, if any.
    #[must_use]
    pub const fn device_id(&self) -> Option<&'a str> {
        match self {
            Self::Sensors(device_id) | Self::Data(device_id) => Some(device_id),
            Self::Response { .. } | Self::Other => None,
        }
    }
}

fn device_with_suffix<'a>(topic: &'a str, suffix: &str) -> Option<&'a str> {
    let rest = topic.strip_suffix(suffix)?.strip_suffix(SEPARATOR)?;
    let device_id = rest.rsplit(SEPARATOR).next()?;
    (!device_id.is_empty()).then_some(device_id)
}

/// Checks whether a topic matches a subscription filter.
///
/// The `+` wildcard matches exactly one level, while the `#` wildcard
/// matches the parent level and all the levels below it.
#[must_use]
pub fn matches_filter(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split(SEPARATOR);
    let mut topic_levels = topic.split(SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) | (None, None) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => {}
            (Some(filter_level), Some(topic_level)) if filter_level == topic_level => {}
            _ => return false,
        }
    }
}
