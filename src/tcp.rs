//! TCP header flag bits and the predicates the flow mutex engine keys on.
//!
//! Flag positions follow the TCP header (IANA "TCP Header Flags" registry),
//! LSB first: FIN, SYN, RST, PSH, ACK, URG, ECE, CWR.

/// FIN: No more data from sender
pub const TCP_FLAG_FIN: u8 = 0x01;
/// SYN: Synchronize sequence numbers
pub const TCP_FLAG_SYN: u8 = 0x02;
/// RST: Reset the connection
pub const TCP_FLAG_RST: u8 = 0x04;
/// PSH: Push function
pub const TCP_FLAG_PSH: u8 = 0x08;
/// ACK: Acknowledgment field is significant
pub const TCP_FLAG_ACK: u8 = 0x10;
/// URG: Urgent pointer field is significant
pub const TCP_FLAG_URG: u8 = 0x20;
/// ECE: ECN-Echo
pub const TCP_FLAG_ECE: u8 = 0x40;
/// CWR: Congestion Window Reduced
pub const TCP_FLAG_CWR: u8 = 0x80;

/// True when the segment tears the connection down (FIN or RST).
///
/// Termination segments must drain the flow's wait-group before they may
/// acquire the carrier mutex.
pub const fn is_connection_termination(flags: u8) -> bool {
    flags & (TCP_FLAG_FIN | TCP_FLAG_RST) != 0
}

/// True for segments that open or tear down a connection (SYN, FIN or RST).
///
/// Only segments outside this set may install trace-tracking state; letting
/// handshake or termination segments track would leave state behind that no
/// response can ever match.
pub const fn is_syn_fin_rst(flags: u8) -> bool {
    flags & (TCP_FLAG_SYN | TCP_FLAG_FIN | TCP_FLAG_RST) != 0
}

/// Render the set flags as a `fin|ack`-style string for the debug stream.
pub fn flags_str(flags: u8) -> String {
    const NAMES: [(u8, &str); 8] = [
        (TCP_FLAG_FIN, "fin"),
        (TCP_FLAG_SYN, "syn"),
        (TCP_FLAG_RST, "rst"),
        (TCP_FLAG_PSH, "psh"),
        (TCP_FLAG_ACK, "ack"),
        (TCP_FLAG_URG, "urg"),
        (TCP_FLAG_ECE, "ece"),
        (TCP_FLAG_CWR, "cwr"),
    ];

    let set: Vec<&str> = NAMES
        .iter()
        .filter_map(|(bit, name)| if flags & bit != 0 { Some(*name) } else { None })
        .collect();
    set.join("|")
}
