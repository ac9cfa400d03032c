use solana_program::{
    instruction::{AccountMeta, Instruction},
    program_error::ProgramError,
    pubkey::Pubkey,
    sysvar,
};

use crate::error::EscrowError::InvalidInstruction;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscrowInstruction {
    /// Starts the trade by creating and populating an escrow account and transferring
    /// ownership of the given temp token account to the program's derived authority.
    ///
    /// Accounts expected:
    ///
    /// 0. `[signer]` The account of the person initializing the escrow
    /// 1. `[writable]` Temporary token account that should be created prior to this instruction and owned by the initializer
    /// 2. `[]` The initializer's token account for the token they will receive should the trade go through
    /// 3. `[writable]` The escrow account, it will hold all necessary info about the trade.
    /// 4. `[]` The rent sysvar
    /// 5. `[]` The token program
    InitEscrow {
        /// The amount party A expects to receive of token Y
        amount: u64,
    },
    /// Accepts a trade
    ///
    /// Accounts expected:
    ///
    /// 0. `[signer]` The account of the person taking the trade
    /// 1. `[writable]` The taker's token account for the token they send
    /// 2. `[writable]` The taker's token account for the token they will receive should the trade go through
    /// 3. `[writable]` The PDA's temp token account to get tokens from and eventually close
    /// 4. `[writable]` The initializer's main account to send their rent fees to
    /// 5. `[writable]` The initializer's token account that will receive tokens
    /// 6. `[writable]` The escrow account holding the escrow info
    /// 7. `[]` The token program
    /// 8. `[]` The PDA account
    Exchange {
        /// the amount the taker expects to be paid in the other token, as a u64 because that's the max possible supply of a token
        amount: u64,
    },
    /// Cancels a trade, returning the held tokens to the initializer
    ///
    /// Accounts expected:
    ///
    /// 0. `[signer]` The initializer
    /// 1. `[writable]` The PDA's temp token account
    /// 2. `[writable]` The initializer's token account for the held token
    /// 3. `[writable]` The escrow account holding the escrow info
    /// 4. `[]` The token program
    /// 5. `[]` The PDA account
    Cancel,
}

impl EscrowInstruction {
    /// Unpacks a byte buffer into a [EscrowInstruction](enum.EscrowInstruction.html).
    pub fn unpack(input: &[u8]) -> Result<Self, ProgramError> {
        let (tag, rest) = input.split_first().ok_or(InvalidInstruction)?;

        Ok(match tag {
            0 => Self::InitEscrow {
                amount: Self::unpack_amount(rest)?,
            },
            1 => Self::Exchange {
                amount: Self::unpack_amount(rest)?,
            },
            2 if rest.is_empty() => Self::Cancel,
            _ => return Err(InvalidInstruction.into()),
        })
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9);
        match *self {
            Self::InitEscrow { amount } => {
                buf.push(0);
                buf.extend_from_slice(&amount.to_le_bytes());
            }
            Self::Exchange { amount } => {
                buf.push(1);
                buf.extend_from_slice(&amount.to_le_bytes());
            }
            Self::Cancel => buf.push(2),
        }
        buf
    }

    /// The amount must be exactly the rest of the payload.
    fn unpack_amount(input: &[u8]) -> Result<u64, ProgramError> {
        let amount = <[u8; 8]>::try_from(input)
            .map(u64::from_le_bytes)
            .map_err(|_| InvalidInstruction)?;
        Ok(amount)
    }
}

/// Creates an `InitEscrow` instruction.
pub fn init_escrow(
    program_id: &Pubkey,
    initializer: &Pubkey,
    temp_token_account: &Pubkey,
    token_to_receive_account: &Pubkey,
    escrow_account: &Pubkey,
    amount: u64,
) -> Result<Instruction, ProgramError> {
    let data = EscrowInstruction::InitEscrow { amount }.pack();
    let accounts = vec![
        AccountMeta::new_readonly(*initializer, true),
        AccountMeta::new(*temp_token_account, false),
        AccountMeta::new_readonly(*token_to_receive_account, false),
        AccountMeta::new(*escrow_account, false),
        AccountMeta::new_readonly(sysvar::rent::id(), false),
        AccountMeta::new_readonly(spl_token::id(), false),
    ];

    Ok(Instruction {
        program_id: *program_id,
        accounts,
        data,
    })
}

/// Creates an `Exchange` instruction.
#[allow(clippy::too_many_arguments)]
pub fn exchange(
    program_id: &Pubkey,
    taker: &Pubkey,
    takers_sending_token_account: &Pubkey,
    takers_token_to_receive_account: &Pubkey,
    pdas_temp_token_account: &Pubkey,
    initializers_main_account: &Pubkey,
    initializers_token_to_receive_account: &Pubkey,
    escrow_account: &Pubkey,
    amount: u64,
) -> Result<Instruction, ProgramError> {
    let (pda, _bump_seed) = crate::escrow_authority(program_id);
    let data = EscrowInstruction::Exchange { amount }.pack();
    let accounts = vec![
        AccountMeta::new_readonly(*taker, true),
        AccountMeta::new(*takers_sending_token_account, false),
        AccountMeta::new(*takers_token_to_receive_account, false),
        AccountMeta::new(*pdas_temp_token_account, false),
        AccountMeta::new(*initializers_main_account, false),
        AccountMeta::new(*initializers_token_to_receive_account, false),
        AccountMeta::new(*escrow_account, false),
        AccountMeta::new_readonly(spl_token::id(), false),
        AccountMeta::new_readonly(pda, false),
    ];

    Ok(Instruction {
        program_id: *program_id,
        accounts,
        data,
    })
}

/// Creates a `Cancel` instruction.
pub fn cancel(
    program_id: &Pubkey,
    initializer: &Pubkey,
    pdas_temp_token_account: &Pubkey,
    initializers_token_account: &Pubkey,
    escrow_account: &Pubkey,
) -> Result<Instruction, ProgramError> {
    let (pda, _bump_seed) = crate::escrow_authority(program_id);
    let accounts = vec![
        AccountMeta::new(*initializer, true),
        AccountMeta::new(*pdas_temp_token_account, false),
        AccountMeta::new(*initializers_token_account, false),
        AccountMeta::new(*escrow_account, false),
        AccountMeta::new_readonly(spl_token::id(), false),
        AccountMeta::new_readonly(pda, false),
    ];

    Ok(Instruction {
        program_id: *program_id,
        accounts,
        data: EscrowInstruction::Cancel.pack(),
    })
}
