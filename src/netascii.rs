// Netascii (RFC 764, as used by RFC 1350) transcoding.
//
// On the wire every line ending is CR LF and a bare carriage return is CR NUL. Decoding has to
// work on one DATA payload at a time, so a CR that ends one packet is carried over to the next
// call through the `previous_cr` flag.

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = 0x00;

/// Converts a chunk of netascii into octets in place.
///
/// Returns the number of converted bytes now at the front of `buf` and the carriage return state
/// to pass to the call for the next chunk. A CR is held back until the byte after it is known;
/// a held CR followed by anything other than NUL, LF or another CR is dropped.
pub fn to_octet(buf: &mut [u8], previous_cr: bool) -> (usize, bool) {
    let mut pending = previous_cr;
    let mut out = 0;

    for i in 0..buf.len() {
        let b = buf[i];
        let emitted = match b {
            CR => {
                let held = pending;
                pending = true;
                if held {
                    Some(CR)
                } else {
                    None
                }
            }
            NUL if pending => {
                pending = false;
                Some(CR)
            }
            _ => {
                pending = false;
                Some(b)
            }
        };

        if let Some(b) = emitted {
            buf[out] = b;
            out += 1;
        }
    }

    (out, pending)
}

/// Expands octets into netascii: CR becomes CR NUL and LF becomes CR LF.
///
/// The result is at most twice the input length. Apply it once per outgoing chunk; it must never
/// run over data that has already been expanded.
pub fn to_netascii(buf: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len() * 2);
    for &b in buf {
        match b {
            CR => out.extend_from_slice(&[CR, NUL]),
            LF => out.extend_from_slice(&[CR, LF]),
            _ => out.push(b),
        }
    }
    out
}
