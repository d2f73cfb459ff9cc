use bitcoin::{address::NetworkUnchecked, Address, Script};

use crate::types::AddressType;

/// Maps an address string to its script-type tag. Only used for size
/// accounting; unparsable addresses degrade to `Unknown`, which the fee table
/// prices conservatively.
pub fn classify_address(address: &str) -> AddressType {
    let Ok(parsed) = address.parse::<Address<NetworkUnchecked>>() else {
        return AddressType::Unknown;
    };
    // The network doesn't matter for classification, only the script kind.
    match parsed.assume_checked().address_type() {
        Some(bitcoin::AddressType::P2pkh) => AddressType::P2pkh,
        Some(bitcoin::AddressType::P2sh) => AddressType::P2sh,
        Some(bitcoin::AddressType::P2wpkh) => AddressType::P2wpkh,
        Some(bitcoin::AddressType::P2wsh) => AddressType::P2wsh,
        Some(bitcoin::AddressType::P2tr) => AddressType::P2tr,
        _ => AddressType::Unknown,
    }
}

/// Maps a locking script to its script-type tag. This is the authoritative
/// classifier for anything already in the transaction.
pub fn classify_script(script: &Script) -> AddressType {
    if script.is_op_return() {
        AddressType::OpReturn(script.len())
    } else if script.is_p2pkh() {
        AddressType::P2pkh
    } else if script.is_p2sh() {
        AddressType::P2sh
    } else if script.is_p2wpkh() {
        AddressType::P2wpkh
    } else if script.is_p2wsh() {
        AddressType::P2wsh
    } else if script.is_p2tr() {
        AddressType::P2tr
    } else {
        AddressType::Unknown
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::script::PushBytesBuf;
    use bitcoin::ScriptBuf;

    use super::*;

    #[test]
    fn test_classify_address() {
        // Genesis coinbase address.
        assert_eq!(
            classify_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"),
            AddressType::P2pkh
        );
        assert_eq!(
            classify_address("bcrt1pxqkh0g270lucjafgngmwv7vtgc8mk9j5y4j8fnrxm77yunuh398qfv8tqp"),
            AddressType::P2tr
        );
        assert_eq!(classify_address("not an address"), AddressType::Unknown);
    }

    #[test]
    fn test_classify_op_return_script() {
        let mut payload = PushBytesBuf::new();
        payload.extend_from_slice(&[0xAB; 20]).unwrap();
        let script = ScriptBuf::new_op_return(payload);
        assert_eq!(classify_script(&script), AddressType::OpReturn(script.len()));
    }
}
