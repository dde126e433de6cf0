use bytes::Bytes;

// Diameter Command Codes (RFC 6733 base protocol)
pub const CMD_CER: u32 = 257;
pub const CMD_DWR: u32 = 280;
pub const CMD_DPR: u32 = 282;

// AVP Codes
pub const AVP_HOST_IP_ADDRESS: u32 = 257;
pub const AVP_AUTH_APPLICATION_ID: u32 = 258;
pub const AVP_ORIGIN_HOST: u32 = 264;
pub const AVP_VENDOR_ID: u32 = 266;
pub const AVP_RESULT_CODE: u32 = 268;
pub const AVP_PRODUCT_NAME: u32 = 269;
pub const AVP_DISCONNECT_CAUSE: u32 = 273;
pub const AVP_ORIGIN_STATE_ID: u32 = 278;
pub const AVP_ORIGIN_REALM: u32 = 296;

// Result-Code values (AVP 268)
pub const RESULT_CODE_SUCCESS: u32 = 2001; // DIAMETER_SUCCESS
pub const RESULT_CODE_UNABLE_TO_DELIVER: u32 = 3002; // DIAMETER_UNABLE_TO_DELIVER
pub const RESULT_CODE_UNABLE_TO_COMPLY: u32 = 5012; // DIAMETER_UNABLE_TO_COMPLY

// Disconnect-Cause values (AVP 273)
pub const DISCONNECT_CAUSE_REBOOTING: u32 = 0;
pub const DISCONNECT_CAUSE_BUSY: u32 = 1;
pub const DISCONNECT_CAUSE_DO_NOT_WANT_TO_TALK_TO_YOU: u32 = 2;

// Header flags
pub const FLAG_REQUEST: u8 = 0x80;
pub const AVP_FLAG_MANDATORY: u8 = 0x40;

/// Identifies one transport connection for the lifetime of the process.
pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct Avp {
    pub code: u32,
    pub flags: u8,
    pub length: u32,
    pub vendor_id: Option<u32>,
    pub data: Bytes, // Zero-copy friendly
}

impl Avp {
    pub fn new(code: u32, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            code,
            flags: AVP_FLAG_MANDATORY,
            length: 8 + data.len() as u32,
            vendor_id: None,
            data,
        }
    }

    /// Unsigned32 / Enumerated AVP
    pub fn u32(code: u32, value: u32) -> Self {
        Self::new(code, value.to_be_bytes().to_vec())
    }

    /// UTF8String / DiameterIdentity AVP
    pub fn string(code: u32, value: &str) -> Self {
        Self::new(code, value.as_bytes().to_vec())
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.data).to_string()
    }

    pub fn as_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.data[..].try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiameterMessage {
    pub version: u8,
    pub flags: u8,
    pub command_code: u32,
    pub application_id: u32,
    pub hop_by_hop_id: u32,
    pub end_to_end_id: u32,
    pub is_request: bool,
    pub avps: Vec<Avp>,
    /// Connection the message arrived on (set by the transport on receipt)
    pub connection: Option<ConnectionId>,
    /// On an answer: the request it resulted from, when one was pending
    pub request: Option<Box<DiameterMessage>>,
}

impl DiameterMessage {
    pub fn new(command_code: u32, is_request: bool) -> Self {
        Self {
            version: 1,
            flags: if is_request { FLAG_REQUEST } else { 0x00 },
            command_code,
            application_id: 0,
            hop_by_hop_id: 0,
            end_to_end_id: 0,
            is_request,
            avps: Vec::new(),
            connection: None,
            request: None,
        }
    }

    pub fn request(command_code: u32, application_id: u32) -> Self {
        let mut msg = Self::new(command_code, true);
        msg.application_id = application_id;
        msg
    }

    /// Build the answer to this request carrying the given Result-Code.
    ///
    /// The answer keeps the identifiers needed to correlate it on the remote
    /// side and is bound to the connection the request arrived on.
    pub fn create_answer(&self, result_code: u32) -> DiameterMessage {
        let mut answer = Self::new(self.command_code, false);
        answer.application_id = self.application_id;
        answer.hop_by_hop_id = self.hop_by_hop_id;
        answer.end_to_end_id = self.end_to_end_id;
        answer.connection = self.connection;
        answer.add_avp(Avp::u32(AVP_RESULT_CODE, result_code));
        answer
    }

    // Helper: Get specific AVP
    pub fn get_avp(&self, code: u32) -> Option<&Avp> {
        self.avps.iter().find(|a| a.code == code)
    }

    // Helper: Add or replace AVP
    pub fn set_avp(&mut self, avp: Avp) {
        if let Some(existing) = self.avps.iter_mut().find(|a| a.code == avp.code) {
            *existing = avp;
        } else {
            self.avps.push(avp);
        }
    }

    // Helper: Append AVP (repeated AVPs allowed)
    pub fn add_avp(&mut self, avp: Avp) {
        self.avps.push(avp);
    }

    pub fn result_code(&self) -> Option<u32> {
        self.get_avp(AVP_RESULT_CODE).and_then(Avp::as_u32)
    }

    pub fn disconnect_cause(&self) -> Option<u32> {
        self.get_avp(AVP_DISCONNECT_CAUSE).and_then(Avp::as_u32)
    }

    pub fn origin_host(&self) -> Option<String> {
        self.get_avp(AVP_ORIGIN_HOST).map(Avp::as_string)
    }

    // Helper: Check message type
    pub fn is_cer(&self) -> bool { self.command_code == CMD_CER && self.is_request }
    pub fn is_cea(&self) -> bool { self.command_code == CMD_CER && !self.is_request }
    pub fn is_dwr(&self) -> bool { self.command_code == CMD_DWR && self.is_request }
    pub fn is_dwa(&self) -> bool { self.command_code == CMD_DWR && !self.is_request }
    pub fn is_dpr(&self) -> bool { self.command_code == CMD_DPR && self.is_request }
    pub fn is_dpa(&self) -> bool { self.command_code == CMD_DPR && !self.is_request }

    /// CER/CEA, DWR/DWA and DPR/DPA are consumed by the peer itself.
    pub fn is_control(&self) -> bool {
        matches!(self.command_code, CMD_CER | CMD_DWR | CMD_DPR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_answer_keeps_identifiers() {
        let mut dpr = DiameterMessage::request(CMD_DPR, 0);
        dpr.hop_by_hop_id = 7;
        dpr.end_to_end_id = 9;
        dpr.connection = Some(3);
        dpr.add_avp(Avp::u32(AVP_DISCONNECT_CAUSE, DISCONNECT_CAUSE_REBOOTING));

        let dpa = dpr.create_answer(RESULT_CODE_SUCCESS);
        assert!(dpa.is_dpa());
        assert_eq!(dpa.hop_by_hop_id, 7);
        assert_eq!(dpa.end_to_end_id, 9);
        assert_eq!(dpa.connection, Some(3));
        assert_eq!(dpa.result_code(), Some(RESULT_CODE_SUCCESS));
        assert_eq!(dpa.flags & FLAG_REQUEST, 0);
        assert_eq!(dpr.disconnect_cause(), Some(DISCONNECT_CAUSE_REBOOTING));
    }

    #[test]
    fn test_control_commands() {
        assert!(DiameterMessage::new(CMD_CER, true).is_control());
        assert!(DiameterMessage::new(CMD_DWR, false).is_control());
        assert!(!DiameterMessage::new(272, true).is_control());
    }

    #[test]
    fn test_avp_readers() {
        let host = Avp::string(AVP_ORIGIN_HOST, "peer.example.com");
        assert_eq!(host.as_string(), "peer.example.com");
        assert_eq!(host.length, 8 + 16);
        assert_eq!(host.as_u32(), None);
        assert_eq!(Avp::u32(AVP_RESULT_CODE, 2001).as_u32(), Some(2001));
    }
}
