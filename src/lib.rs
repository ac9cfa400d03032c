pub mod error;
pub mod instruction;
pub mod processor;
pub mod state;

#[cfg(not(feature = "no-entrypoint"))]
mod entrypoint;

#[cfg(not(target_os = "solana"))]
pub mod client;

use solana_program::pubkey::Pubkey;

solana_program::declare_id!("F23xR3HKP9LycZcV5CdbAoHSFGm1btYP5npArW1Cky3E");

/// Seed of the program-derived address that owns every holding account.
pub const ESCROW_SEED: &[u8] = b"escrow";

/// Derives the authority (and its bump) the program signs with when it moves held funds.
pub fn escrow_authority(program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[ESCROW_SEED], program_id)
}
