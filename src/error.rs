use solana_program::program_error::ProgramError;
use thiserror::Error;

/// Failures the escrow program reports as `ProgramError::Custom(code)`.
///
/// Codes are the discriminants and are part of the program's public contract.
/// They start at 0x100 so they never collide with token program errors that
/// surface from a cross-program invocation at the same instruction index.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum EscrowError {
    #[error("Invalid Instruction")]
    InvalidInstruction = 0x100,
    #[error("Not Rent Exempt")]
    NotRentExempt = 0x101,
    #[error("Amount Overflow")]
    AmountOverflow = 0x102,
    #[error("Expected Amount Mismatch")]
    ExpectedAmountMismatch = 0x103,
    /// Escrow account data is not a valid record.
    #[error("Malformed Record")]
    MalformedRecord = 0x104,
    /// A supplied account differs from the one bound at initialization.
    #[error("Account Mismatch")]
    AccountMismatch = 0x105,
    #[error("Escrow Not Initialized")]
    NotInitialized = 0x106,
    #[error("Unauthorized")]
    Unauthorized = 0x107,
    #[error("Insufficient Balance")]
    InsufficientBalance = 0x108,
}

impl EscrowError {
    pub fn from_code(code: u32) -> Option<Self> {
        let err = match code {
            0x100 => Self::InvalidInstruction,
            0x101 => Self::NotRentExempt,
            0x102 => Self::AmountOverflow,
            0x103 => Self::ExpectedAmountMismatch,
            0x104 => Self::MalformedRecord,
            0x105 => Self::AccountMismatch,
            0x106 => Self::NotInitialized,
            0x107 => Self::Unauthorized,
            0x108 => Self::InsufficientBalance,
            _ => return None,
        };
        Some(err)
    }
}

impl From<EscrowError> for ProgramError {
    fn from(e: EscrowError) -> Self {
        ProgramError::Custom(e as u32)
    }
}
