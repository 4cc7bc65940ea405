//! The message catalog (C2): one variant per message kind named in §2/§6,
//! each carrying a message-ID, a type tag, and a type-specific body, with
//! `encode`/`decode` dispatching on that tag the way §4.2/§9 ask for
//! ("re-express [runtime type discrimination] as a tagged-variant per
//! message kind plus a dispatch in the receive loop").

use crate::error::{CoreError, CoreResult};
use crate::wire::element::Element;

/// Every message on the wire is `{ messageId, messageType, body }`.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: u64,
    pub body: MessageBody,
}

impl Envelope {
    pub fn new(id: u64, body: MessageBody) -> Self {
        Self { id, body }
    }

    pub fn encode(&self) -> Element {
        Element::Sequence(vec![
            Element::Integer(self.id as i64),
            Element::Enumerated(self.body.type_tag() as i64),
            self.body.encode(),
        ])
    }

    pub fn decode(element: &Element) -> CoreResult<Envelope> {
        let fields = element.as_sequence()?;
        if fields.len() != 3 {
            return Err(CoreError::Protocol(format!(
                "envelope expects 3 fields, got {}",
                fields.len()
            )));
        }
        let id = fields[0].as_integer()? as u64;
        let type_tag = fields[1].as_enumerated()?;
        let body = MessageBody::decode(type_tag, &fields[2])?;
        Ok(Envelope { id, body })
    }
}

macro_rules! message_catalog {
    ($($tag:literal => $variant:ident($payload:ty)),* $(,)?) => {
        #[derive(Debug, Clone, PartialEq)]
        pub enum MessageBody {
            $($variant($payload)),*
        }

        impl MessageBody {
            pub fn type_tag(&self) -> i64 {
                match self {
                    $(MessageBody::$variant(_) => $tag),*
                }
            }

            fn encode(&self) -> Element {
                match self {
                    $(MessageBody::$variant(payload) => payload.encode()),*
                }
            }

            fn decode(type_tag: i64, element: &Element) -> CoreResult<MessageBody> {
                match type_tag {
                    $($tag => Ok(MessageBody::$variant(<$payload>::decode(element)?)),)*
                    other => Err(CoreError::Protocol(format!(
                        "unknown message type tag {other}"
                    ))),
                }
            }
        }
    };
}

message_catalog! {
    0 => ClientHello(ClientHello),
    1 => ClientManagerHello(ClientManagerHello),
    2 => HelloResponse(HelloResponse),
    3 => Keepalive(Keepalive),
    4 => ServerShutdown(ServerShutdown),
    5 => StatusRequest(StatusRequest),
    6 => StatusResponse(StatusResponse),
    7 => JobRequest(JobRequest),
    8 => JobResponse(JobResponse),
    9 => JobControlRequest(JobControlRequest),
    10 => JobControlResponse(JobControlResponse),
    11 => JobCompleted(JobCompleted),
    12 => ClassTransferRequest(ClassTransferRequest),
    13 => ClassTransferResponse(ClassTransferResponse),
    14 => RegisterStat(RegisterStat),
    15 => ReportStat(ReportStat),
    16 => StartClientRequest(StartClientRequest),
    17 => StartClientResponse(StartClientResponse),
    18 => StopClientRequest(StopClientRequest),
    19 => StopClientResponse(StopClientResponse),
}

trait Body: Sized {
    fn encode(&self) -> Element;
    fn decode(element: &Element) -> CoreResult<Self>;
}

fn opt_string(value: &Option<String>) -> Element {
    match value {
        Some(s) => Element::utf8_string(s.clone()),
        None => Element::OctetString(Vec::new()),
    }
}

fn decode_opt_string(element: &Element) -> CoreResult<Option<String>> {
    let bytes = element.as_octet_string()?;
    if bytes.is_empty() {
        Ok(None)
    } else {
        Ok(Some(element.as_utf8_string()?))
    }
}

fn opt_bytes(value: &Option<Vec<u8>>) -> Element {
    match value {
        Some(bytes) => {
            Element::Sequence(vec![Element::Boolean(true), Element::OctetString(bytes.clone())])
        }
        None => Element::Sequence(vec![Element::Boolean(false), Element::OctetString(Vec::new())]),
    }
}

fn decode_opt_bytes(element: &Element) -> CoreResult<Option<Vec<u8>>> {
    let fields = element.as_sequence()?;
    if fields.len() != 2 {
        return Err(CoreError::Protocol("malformed optional byte string".into()));
    }
    if fields[0].as_boolean()? {
        Ok(Some(fields[1].as_octet_string()?.to_vec()))
    } else {
        Ok(None)
    }
}

fn string_seq(values: &[String]) -> Element {
    Element::Sequence(values.iter().cloned().map(Element::utf8_string).collect())
}

fn decode_string_seq(element: &Element) -> CoreResult<Vec<String>> {
    element
        .as_sequence()?
        .iter()
        .map(|e| e.as_utf8_string())
        .collect()
}

// --- client-hello / client-manager-hello -----------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ClientHello {
    pub client_id: String,
    pub client_version: String,
    pub auth_id: Option<String>,
    pub credentials: Option<Vec<u8>>,
    pub scheme: Option<String>,
    pub supports_time_sync: bool,
    pub restricted: bool,
}

impl Body for ClientHello {
    fn encode(&self) -> Element {
        Element::Sequence(vec![
            Element::utf8_string(self.client_id.clone()),
            Element::utf8_string(self.client_version.clone()),
            opt_string(&self.auth_id),
            opt_bytes(&self.credentials),
            opt_string(&self.scheme),
            Element::Boolean(self.supports_time_sync),
            Element::Boolean(self.restricted),
        ])
    }

    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 7)?;
        Ok(ClientHello {
            client_id: f[0].as_utf8_string()?,
            client_version: f[1].as_utf8_string()?,
            auth_id: decode_opt_string(&f[2])?,
            credentials: decode_opt_bytes(&f[3])?,
            scheme: decode_opt_string(&f[4])?,
            supports_time_sync: f[5].as_boolean()?,
            restricted: f[6].as_boolean()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientManagerHello {
    pub client_id: String,
    pub client_version: String,
    pub max_clients_this_host: u32,
}

impl Body for ClientManagerHello {
    fn encode(&self) -> Element {
        Element::Sequence(vec![
            Element::utf8_string(self.client_id.clone()),
            Element::utf8_string(self.client_version.clone()),
            Element::Integer(self.max_clients_this_host as i64),
        ])
    }

    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 3)?;
        Ok(ClientManagerHello {
            client_id: f[0].as_utf8_string()?,
            client_version: f[1].as_utf8_string()?,
            max_clients_this_host: f[2].as_integer()? as u32,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloCode {
    Success,
    ServerError,
    ClientRejected,
    ConnectionLimitReached,
    AuthenticationFailed,
}

impl HelloCode {
    fn tag(self) -> i64 {
        match self {
            HelloCode::Success => 0,
            HelloCode::ServerError => 1,
            HelloCode::ClientRejected => 2,
            HelloCode::ConnectionLimitReached => 3,
            HelloCode::AuthenticationFailed => 4,
        }
    }

    fn from_tag(tag: i64) -> CoreResult<Self> {
        Ok(match tag {
            0 => HelloCode::Success,
            1 => HelloCode::ServerError,
            2 => HelloCode::ClientRejected,
            3 => HelloCode::ConnectionLimitReached,
            4 => HelloCode::AuthenticationFailed,
            other => return Err(CoreError::Protocol(format!("unknown hello code {other}"))),
        })
    }
}

/// Sentinel the wire uses when the agent didn't ask for a time sync.
pub const NO_TIME_SYNC: i64 = -1;

#[derive(Debug, Clone, PartialEq)]
pub struct HelloResponse {
    pub code: HelloCode,
    pub message: String,
    pub server_time_millis: i64,
}

impl Body for HelloResponse {
    fn encode(&self) -> Element {
        Element::Sequence(vec![
            Element::Enumerated(self.code.tag()),
            Element::utf8_string(self.message.clone()),
            Element::Integer(self.server_time_millis),
        ])
    }

    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 3)?;
        Ok(HelloResponse {
            code: HelloCode::from_tag(f[0].as_enumerated()?)?,
            message: f[1].as_utf8_string()?,
            server_time_millis: f[2].as_integer()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive;

impl Body for Keepalive {
    fn encode(&self) -> Element {
        Element::Sequence(vec![])
    }
    fn decode(_element: &Element) -> CoreResult<Self> {
        Ok(Keepalive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerShutdown;

impl Body for ServerShutdown {
    fn encode(&self) -> Element {
        Element::Sequence(vec![])
    }
    fn decode(_element: &Element) -> CoreResult<Self> {
        Ok(ServerShutdown)
    }
}

// --- status -----------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct StatusRequest {
    pub job_id: Option<String>,
}

impl Body for StatusRequest {
    fn encode(&self) -> Element {
        Element::Sequence(vec![opt_string(&self.job_id)])
    }
    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 1)?;
        Ok(StatusRequest {
            job_id: decode_opt_string(&f[0])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    NoResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Running,
    ShuttingDown,
    Unknown,
}

impl ClientState {
    fn tag(self) -> i64 {
        match self {
            ClientState::Idle => 0,
            ClientState::Running => 1,
            ClientState::ShuttingDown => 2,
            ClientState::Unknown => 3,
        }
    }

    fn from_tag(tag: i64) -> CoreResult<Self> {
        Ok(match tag {
            0 => ClientState::Idle,
            1 => ClientState::Running,
            2 => ClientState::ShuttingDown,
            3 => ClientState::Unknown,
            other => return Err(CoreError::Protocol(format!("unknown client state {other}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusResponse {
    pub code: StatusCode,
    pub client_state: ClientState,
    pub job_id: Option<String>,
    pub message: String,
}

impl Body for StatusResponse {
    fn encode(&self) -> Element {
        Element::Sequence(vec![
            Element::Enumerated(match self.code {
                StatusCode::Success => 0,
                StatusCode::NoResponse => 1,
            }),
            Element::Enumerated(self.client_state.tag()),
            opt_string(&self.job_id),
            Element::utf8_string(self.message.clone()),
        ])
    }

    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 4)?;
        let code = match f[0].as_enumerated()? {
            0 => StatusCode::Success,
            1 => StatusCode::NoResponse,
            other => return Err(CoreError::Protocol(format!("unknown status code {other}"))),
        };
        Ok(StatusResponse {
            code,
            client_state: ClientState::from_tag(f[1].as_enumerated()?)?,
            job_id: decode_opt_string(&f[2])?,
            message: f[3].as_utf8_string()?,
        })
    }
}

// --- job request/response ----------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub job_id: String,
    pub job_class: String,
    pub client_number: u32,
    pub threads: u32,
    pub thread_startup_delay_ms: u32,
    pub collection_interval_secs: u32,
    pub duration_secs: i64,
    pub parameters: Vec<String>,
}

impl Body for JobRequest {
    fn encode(&self) -> Element {
        Element::Sequence(vec![
            Element::utf8_string(self.job_id.clone()),
            Element::utf8_string(self.job_class.clone()),
            Element::Integer(self.client_number as i64),
            Element::Integer(self.threads as i64),
            Element::Integer(self.thread_startup_delay_ms as i64),
            Element::Integer(self.collection_interval_secs as i64),
            Element::Integer(self.duration_secs),
            string_seq(&self.parameters),
        ])
    }

    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 8)?;
        Ok(JobRequest {
            job_id: f[0].as_utf8_string()?,
            job_class: f[1].as_utf8_string()?,
            client_number: f[2].as_integer()? as u32,
            threads: f[3].as_integer()? as u32,
            thread_startup_delay_ms: f[4].as_integer()? as u32,
            collection_interval_secs: f[5].as_integer()? as u32,
            duration_secs: f[6].as_integer()?,
            parameters: decode_string_seq(&f[7])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    ClassNotFound,
    ClassNotValid,
    JobCreationFailure,
    NoSuchJob,
    ServerError,
    NoResponse,
    LocalError,
}

impl ResultCode {
    fn tag(self) -> i64 {
        match self {
            ResultCode::Success => 0,
            ResultCode::ClassNotFound => 1,
            ResultCode::ClassNotValid => 2,
            ResultCode::JobCreationFailure => 3,
            ResultCode::NoSuchJob => 4,
            ResultCode::ServerError => 5,
            ResultCode::NoResponse => 6,
            ResultCode::LocalError => 7,
        }
    }

    fn from_tag(tag: i64) -> CoreResult<Self> {
        Ok(match tag {
            0 => ResultCode::Success,
            1 => ResultCode::ClassNotFound,
            2 => ResultCode::ClassNotValid,
            3 => ResultCode::JobCreationFailure,
            4 => ResultCode::NoSuchJob,
            5 => ResultCode::ServerError,
            6 => ResultCode::NoResponse,
            7 => ResultCode::LocalError,
            other => return Err(CoreError::Protocol(format!("unknown result code {other}"))),
        })
    }

    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobResponse {
    pub code: ResultCode,
    pub message: String,
}

impl Body for JobResponse {
    fn encode(&self) -> Element {
        Element::Sequence(vec![
            Element::Enumerated(self.code.tag()),
            Element::utf8_string(self.message.clone()),
        ])
    }
    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 2)?;
        Ok(JobResponse {
            code: ResultCode::from_tag(f[0].as_enumerated()?)?,
            message: f[1].as_utf8_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobControlType {
    Stop,
    StopDueToShutdown,
}

impl JobControlType {
    fn tag(self) -> i64 {
        match self {
            JobControlType::Stop => 0,
            JobControlType::StopDueToShutdown => 1,
        }
    }
    fn from_tag(tag: i64) -> CoreResult<Self> {
        Ok(match tag {
            0 => JobControlType::Stop,
            1 => JobControlType::StopDueToShutdown,
            other => return Err(CoreError::Protocol(format!("unknown control type {other}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobControlRequest {
    pub job_id: String,
    pub control_type: JobControlType,
}

impl Body for JobControlRequest {
    fn encode(&self) -> Element {
        Element::Sequence(vec![
            Element::utf8_string(self.job_id.clone()),
            Element::Enumerated(self.control_type.tag()),
        ])
    }
    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 2)?;
        Ok(JobControlRequest {
            job_id: f[0].as_utf8_string()?,
            control_type: JobControlType::from_tag(f[1].as_enumerated()?)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobControlResponse {
    pub code: ResultCode,
    pub message: String,
}

impl Body for JobControlResponse {
    fn encode(&self) -> Element {
        Element::Sequence(vec![
            Element::Enumerated(self.code.tag()),
            Element::utf8_string(self.message.clone()),
        ])
    }
    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 2)?;
        Ok(JobControlResponse {
            code: ResultCode::from_tag(f[0].as_enumerated()?)?,
            message: f[1].as_utf8_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCompletionState {
    CompletedSuccessfully,
    StoppedByRequest,
    StoppedDueToError,
}

impl JobCompletionState {
    fn tag(self) -> i64 {
        match self {
            JobCompletionState::CompletedSuccessfully => 0,
            JobCompletionState::StoppedByRequest => 1,
            JobCompletionState::StoppedDueToError => 2,
        }
    }
    fn from_tag(tag: i64) -> CoreResult<Self> {
        Ok(match tag {
            0 => JobCompletionState::CompletedSuccessfully,
            1 => JobCompletionState::StoppedByRequest,
            2 => JobCompletionState::StoppedDueToError,
            other => return Err(CoreError::Protocol(format!("unknown completion state {other}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobCompleted {
    pub job_id: String,
    pub state: JobCompletionState,
    pub actual_start_time_millis: i64,
    pub actual_stop_time_millis: i64,
    pub stat_trackers: Vec<String>,
    pub message: Option<String>,
}

impl Body for JobCompleted {
    fn encode(&self) -> Element {
        Element::Sequence(vec![
            Element::utf8_string(self.job_id.clone()),
            Element::Enumerated(self.state.tag()),
            Element::Integer(self.actual_start_time_millis),
            Element::Integer(self.actual_stop_time_millis),
            string_seq(&self.stat_trackers),
            opt_string(&self.message),
        ])
    }
    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 6)?;
        Ok(JobCompleted {
            job_id: f[0].as_utf8_string()?,
            state: JobCompletionState::from_tag(f[1].as_enumerated()?)?,
            actual_start_time_millis: f[2].as_integer()?,
            actual_stop_time_millis: f[3].as_integer()?,
            stat_trackers: decode_string_seq(&f[4])?,
            message: decode_opt_string(&f[5])?,
        })
    }
}

// --- class transfer -----------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ClassTransferRequest {
    pub class_name: String,
}

impl Body for ClassTransferRequest {
    fn encode(&self) -> Element {
        Element::Sequence(vec![Element::utf8_string(self.class_name.clone())])
    }
    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 1)?;
        Ok(ClassTransferRequest {
            class_name: f[0].as_utf8_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassTransferCode {
    Success,
    ClassNotFound,
    ServerError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassTransferResponse {
    pub code: ClassTransferCode,
    pub class_bytes: Option<Vec<u8>>,
}

impl Body for ClassTransferResponse {
    fn encode(&self) -> Element {
        let tag = match self.code {
            ClassTransferCode::Success => 0,
            ClassTransferCode::ClassNotFound => 1,
            ClassTransferCode::ServerError => 2,
        };
        Element::Sequence(vec![Element::Enumerated(tag), opt_bytes(&self.class_bytes)])
    }
    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 2)?;
        let code = match f[0].as_enumerated()? {
            0 => ClassTransferCode::Success,
            1 => ClassTransferCode::ClassNotFound,
            2 => ClassTransferCode::ServerError,
            other => {
                return Err(CoreError::Protocol(format!(
                    "unknown class transfer code {other}"
                )))
            }
        };
        Ok(ClassTransferResponse {
            code,
            class_bytes: decode_opt_bytes(&f[1])?,
        })
    }
}

// --- stats ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterStat {
    pub job_id: String,
    pub stat_names: Vec<String>,
}

impl Body for RegisterStat {
    fn encode(&self) -> Element {
        Element::Sequence(vec![
            Element::utf8_string(self.job_id.clone()),
            string_seq(&self.stat_names),
        ])
    }
    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 2)?;
        Ok(RegisterStat {
            job_id: f[0].as_utf8_string()?,
            stat_names: decode_string_seq(&f[1])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatType {
    Add,
    Average,
    Done,
}

impl StatType {
    fn tag(self) -> i64 {
        match self {
            StatType::Add => 0,
            StatType::Average => 1,
            StatType::Done => 2,
        }
    }
    fn from_tag(tag: i64) -> CoreResult<Self> {
        Ok(match tag {
            0 => StatType::Add,
            1 => StatType::Average,
            2 => StatType::Done,
            other => return Err(CoreError::Protocol(format!("unknown stat type {other}"))),
        })
    }
}

/// A single per-thread sample. §4.6: "stat-done" samples in the existing
/// protocol omit the interval-number field; the parser detects this by
/// inspecting the type tag of the first variable-position field
/// (enumerated = stat-done shape, integer = with-interval shape).
#[derive(Debug, Clone, PartialEq)]
pub struct StatSample {
    pub client_id: String,
    pub thread_id: u32,
    pub stat_name: String,
    pub interval: Option<i64>,
    pub stat_type: StatType,
    pub value: f64,
}

impl StatSample {
    fn encode(&self) -> Element {
        let mut fields = vec![
            Element::utf8_string(self.client_id.clone()),
            Element::Integer(self.thread_id as i64),
            Element::utf8_string(self.stat_name.clone()),
        ];
        // Bug-compatible wire quirk: the interval field is present only
        // for ADD/AVERAGE samples. A DONE sample's variable-position slot
        // carries the stat type directly (an Enumerated) instead.
        match self.stat_type {
            StatType::Done => {
                fields.push(Element::Enumerated(self.stat_type.tag()));
            }
            StatType::Add | StatType::Average => {
                fields.push(Element::Integer(self.interval.unwrap_or(0)));
                fields.push(Element::Enumerated(self.stat_type.tag()));
            }
        }
        fields.push(Element::Integer(encode_f64(self.value)));
        Element::Sequence(fields)
    }

    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        if f.len() < 5 {
            return Err(CoreError::Protocol("malformed stat sample".into()));
        }
        let client_id = f[0].as_utf8_string()?;
        let thread_id = f[1].as_integer()? as u32;
        let stat_name = f[2].as_utf8_string()?;

        // Dual-shape detection on the first variable-position field (index 3).
        let (interval, stat_type, value_idx) = match &f[3] {
            Element::Enumerated(_) => {
                // stat-done shape: no interval field present.
                (None, StatType::from_tag(f[3].as_enumerated()?)?, 4)
            }
            Element::Integer(_) => {
                if f.len() < 6 {
                    return Err(CoreError::Protocol(
                        "malformed with-interval stat sample".into(),
                    ));
                }
                (
                    Some(f[3].as_integer()?),
                    StatType::from_tag(f[4].as_enumerated()?)?,
                    5,
                )
            }
            other => {
                return Err(CoreError::Protocol(format!(
                    "unexpected tag 0x{:02X} in stat sample's variable field",
                    other.tag()
                )))
            }
        };
        let value = decode_f64(f[value_idx].as_integer()?);

        Ok(StatSample {
            client_id,
            thread_id,
            stat_name,
            interval,
            stat_type,
            value,
        })
    }
}

/// Values travel as the raw bits of the `f64`, packed into an `i64` — the
/// element set has no native floating point tag, and bit-exact interop
/// rules out inventing one.
fn encode_f64(value: f64) -> i64 {
    value.to_bits() as i64
}

fn decode_f64(bits: i64) -> f64 {
    f64::from_bits(bits as u64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportStat {
    pub job_id: String,
    pub samples: Vec<StatSample>,
}

impl Body for ReportStat {
    fn encode(&self) -> Element {
        Element::Sequence(vec![
            Element::utf8_string(self.job_id.clone()),
            Element::Sequence(self.samples.iter().map(StatSample::encode).collect()),
        ])
    }
    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 2)?;
        let samples = f[1]
            .as_sequence()?
            .iter()
            .map(StatSample::decode)
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(ReportStat {
            job_id: f[0].as_utf8_string()?,
            samples,
        })
    }
}

// --- client manager control ----------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct StartClientRequest {
    pub count: u32,
    pub load_listener_port: u16,
}

impl Body for StartClientRequest {
    fn encode(&self) -> Element {
        Element::Sequence(vec![
            Element::Integer(self.count as i64),
            Element::Integer(self.load_listener_port as i64),
        ])
    }
    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 2)?;
        Ok(StartClientRequest {
            count: f[0].as_integer()? as u32,
            load_listener_port: f[1].as_integer()? as u16,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartClientResponse {
    pub code: ResultCode,
    pub message: String,
}

impl Body for StartClientResponse {
    fn encode(&self) -> Element {
        Element::Sequence(vec![
            Element::Enumerated(self.code.tag()),
            Element::utf8_string(self.message.clone()),
        ])
    }
    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 2)?;
        Ok(StartClientResponse {
            code: ResultCode::from_tag(f[0].as_enumerated()?)?,
            message: f[1].as_utf8_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopClientRequest {
    /// `<= 0` means "stop all".
    pub count: i32,
}

impl Body for StopClientRequest {
    fn encode(&self) -> Element {
        Element::Sequence(vec![Element::Integer(self.count as i64)])
    }
    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 1)?;
        Ok(StopClientRequest {
            count: f[0].as_integer()? as i32,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopClientResponse {
    pub code: ResultCode,
    pub message: String,
}

impl Body for StopClientResponse {
    fn encode(&self) -> Element {
        Element::Sequence(vec![
            Element::Enumerated(self.code.tag()),
            Element::utf8_string(self.message.clone()),
        ])
    }
    fn decode(element: &Element) -> CoreResult<Self> {
        let f = element.as_sequence()?;
        expect_len(f, 2)?;
        Ok(StopClientResponse {
            code: ResultCode::from_tag(f[0].as_enumerated()?)?,
            message: f[1].as_utf8_string()?,
        })
    }
}

fn expect_len(fields: &[Element], expected: usize) -> CoreResult<()> {
    if fields.len() != expected {
        Err(CoreError::Protocol(format!(
            "expected {} fields, got {}",
            expected,
            fields.len()
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(body: MessageBody) {
        let envelope = Envelope::new(7, body.clone());
        let element = envelope.encode();
        let decoded = Envelope::decode(&element).expect("decode should succeed");
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn round_trips_client_hello() {
        round_trip(MessageBody::ClientHello(ClientHello {
            client_id: "loader-1".into(),
            client_version: "1.0".into(),
            auth_id: None,
            credentials: None,
            scheme: None,
            supports_time_sync: true,
            restricted: false,
        }));
    }

    #[test]
    fn round_trips_hello_response_with_time_sync_sentinel() {
        round_trip(MessageBody::HelloResponse(HelloResponse {
            code: HelloCode::Success,
            message: "ok".into(),
            server_time_millis: NO_TIME_SYNC,
        }));
    }

    #[test]
    fn round_trips_job_request() {
        round_trip(MessageBody::JobRequest(JobRequest {
            job_id: "job-1".into(),
            job_class: "com.example.SearchRateJob".into(),
            client_number: 0,
            threads: 4,
            thread_startup_delay_ms: 0,
            collection_interval_secs: 5,
            duration_secs: 60,
            parameters: vec!["base-dn=dc=example,dc=com".into()],
        }));
    }

    #[test]
    fn round_trips_stat_sample_add_shape() {
        let sample = StatSample {
            client_id: "loader-1".into(),
            thread_id: 3,
            stat_name: "searches".into(),
            interval: Some(2),
            stat_type: StatType::Add,
            value: 12.5,
        };
        let element = sample.encode();
        let decoded = StatSample::decode(&element).unwrap();
        assert_eq!(decoded, sample);
        // sanity: the with-interval shape's variable-position field is an
        // Integer, not an Enumerated.
        assert_eq!(element.as_sequence().unwrap()[3].tag(), Element::Integer(0).tag());
    }

    #[test]
    fn round_trips_stat_sample_done_shape_without_interval() {
        let sample = StatSample {
            client_id: "loader-1".into(),
            thread_id: 3,
            stat_name: "searches".into(),
            interval: None,
            stat_type: StatType::Done,
            value: 0.0,
        };
        let element = sample.encode();
        // the done shape's variable-position field is an Enumerated.
        assert_eq!(
            element.as_sequence().unwrap()[3].tag(),
            Element::Enumerated(0).tag()
        );
        let decoded = StatSample::decode(&element).unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn unknown_envelope_type_tag_is_a_protocol_error() {
        let element = Element::Sequence(vec![
            Element::Integer(1),
            Element::Enumerated(999),
            Element::Sequence(vec![]),
        ]);
        assert!(Envelope::decode(&element).is_err());
    }
}
