//! The state file is responsible for
//!     1) defining state objects that the processor can use
//!     2) serializing and deserializing such objects from and into arrays of u8 respectively.

use solana_program::{
    program_error::ProgramError,
    program_pack::{IsInitialized, Pack, Sealed},
    pubkey::Pubkey,
};

use arrayref::{array_mut_ref, array_ref, array_refs, mut_array_refs};

use crate::error::EscrowError;

/// Terms of one trade, stored in the escrow account.
///
/// Layout (105 bytes):
/// `is_initialized (1) | initializer (32) | temp token account (32) | receiving account (32) | expected amount (8, LE)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Escrow {
    pub is_initialized: bool,
    pub initializer_pubkey: Pubkey,
    pub temp_token_account_pubkey: Pubkey,
    pub initializer_token_to_receive_account_pubkey: Pubkey,
    pub expected_amount: u64,
}

impl Escrow {
    /// Decodes a record, requiring exactly `Escrow::LEN` bytes.
    pub fn decode(input: &[u8]) -> Result<Self, EscrowError> {
        if input.len() != Self::LEN {
            return Err(EscrowError::MalformedRecord);
        }
        Self::from_fixed(array_ref![input, 0, Escrow::LEN])
    }

    pub fn encode(&self) -> [u8; Escrow::LEN] {
        let mut dst = [0u8; Escrow::LEN];
        self.pack_into_slice(&mut dst);
        dst
    }

    fn from_fixed(src: &[u8; Escrow::LEN]) -> Result<Self, EscrowError> {
        let (
            is_initialized,
            initializer_pubkey,
            temp_token_account_pubkey,
            initializer_token_to_receive_account_pubkey,
            expected_amount,
        ) = array_refs![src, 1, 32, 32, 32, 8];
        let is_initialized = match is_initialized {
            [0] => false,
            [1] => true,
            _ => return Err(EscrowError::MalformedRecord),
        };

        Ok(Escrow {
            is_initialized,
            initializer_pubkey: Pubkey::new_from_array(*initializer_pubkey),
            temp_token_account_pubkey: Pubkey::new_from_array(*temp_token_account_pubkey),
            initializer_token_to_receive_account_pubkey: Pubkey::new_from_array(
                *initializer_token_to_receive_account_pubkey,
            ),
            expected_amount: u64::from_le_bytes(*expected_amount),
        })
    }
}

impl Sealed for Escrow {}

impl IsInitialized for Escrow {
    fn is_initialized(&self) -> bool {
        self.is_initialized
    }
}

impl Pack for Escrow {
    const LEN: usize = 105;

    fn unpack_from_slice(src: &[u8]) -> Result<Self, ProgramError> {
        let src = array_ref![src, 0, Escrow::LEN];
        Ok(Self::from_fixed(src)?)
    }

    fn pack_into_slice(&self, dst: &mut [u8]) {
        let dst = array_mut_ref![dst, 0, Escrow::LEN];
        let (
            is_initialized_dst,
            initializer_pubkey_dst,
            temp_token_account_pubkey_dst,
            initializer_token_to_receive_account_pubkey_dst,
            expected_amount_dst,
        ) = mut_array_refs![dst, 1, 32, 32, 32, 8];

        is_initialized_dst[0] = self.is_initialized as u8;
        initializer_pubkey_dst.copy_from_slice(self.initializer_pubkey.as_ref());
        temp_token_account_pubkey_dst.copy_from_slice(self.temp_token_account_pubkey.as_ref());
        initializer_token_to_receive_account_pubkey_dst
            .copy_from_slice(self.initializer_token_to_receive_account_pubkey.as_ref());
        *expected_amount_dst = self.expected_amount.to_le_bytes();
    }
}
