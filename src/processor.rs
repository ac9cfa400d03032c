use solana_program::{
    account_info::{next_account_info, AccountInfo},
    entrypoint::ProgramResult,
    msg,
    program::{invoke, invoke_signed},
    program_error::ProgramError,
    program_option::COption,
    program_pack::Pack,
    pubkey::Pubkey,
    sysvar::{rent::Rent, Sysvar},
};

use spl_token::state::Account as TokenAccount;

use crate::{error::EscrowError, instruction::EscrowInstruction, state::Escrow, ESCROW_SEED};

pub struct Processor;
impl Processor {
    pub fn process(
        program_id: &Pubkey,
        accounts: &[AccountInfo],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = EscrowInstruction::unpack(instruction_data)?;

        match instruction {
            EscrowInstruction::InitEscrow { amount } => {
                msg!("Instruction: InitEscrow");
                Self::process_init_escrow(accounts, amount, program_id)
            }
            EscrowInstruction::Exchange { amount } => {
                msg!("Instruction: Exchange");
                Self::process_exchange(accounts, amount, program_id)
            }
            EscrowInstruction::Cancel => {
                msg!("Instruction: Cancel");
                Self::process_cancel(accounts, program_id)
            }
        }
    }

    fn process_init_escrow(
        accounts: &[AccountInfo],
        amount: u64,
        program_id: &Pubkey,
    ) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        // The party opening the trade; they must sign to hand over the temp account.
        let initializer = next_account_info(account_info_iter)?;

        if !initializer.is_signer {
            return Err(EscrowError::Unauthorized.into());
        }

        let (pda, _bump_seed) = crate::escrow_authority(program_id);

        // Temp token account holding token X. Still owned by the initializer here;
        // custody moves to the PDA below.
        let temp_token_account = next_account_info(account_info_iter)?;
        let temp_token_account_info = TokenAccount::unpack(&temp_token_account.try_borrow_data()?)?;
        assert_token_owner(&temp_token_account_info, initializer.key)?;
        if temp_token_account_info.amount == 0 {
            return Err(EscrowError::InsufficientBalance.into());
        }
        // Changing the owner does not reset the close authority. Anyone else holding
        // it would keep the PDA from ever closing the account.
        match temp_token_account_info.close_authority {
            COption::None => {}
            COption::Some(close_authority) if close_authority == pda => {}
            COption::Some(_) => return Err(EscrowError::AccountMismatch.into()),
        }

        // Initializer's token Y account, must be owned by the token program
        let token_to_receive_account = next_account_info(account_info_iter)?;
        if *token_to_receive_account.owner != spl_token::id() {
            return Err(ProgramError::IncorrectProgramId);
        }

        // Escrow state account, allocated by the caller and assigned to this program
        let escrow_account = next_account_info(account_info_iter)?;
        if escrow_account.owner != program_id {
            return Err(ProgramError::IncorrectProgramId);
        }

        // The rent-exempt threshold depends on the data length.
        let rent = &Rent::from_account_info(next_account_info(account_info_iter)?)?;
        if !rent.is_exempt(escrow_account.lamports(), escrow_account.data_len()) {
            return Err(EscrowError::NotRentExempt.into());
        }

        // A wrongly sized account fails here with MalformedRecord.
        let mut escrow_info = Escrow::decode(&escrow_account.try_borrow_data()?)?;
        if escrow_info.is_initialized {
            return Err(ProgramError::AccountAlreadyInitialized);
        }

        escrow_info.is_initialized = true;
        escrow_info.initializer_pubkey = *initializer.key;
        escrow_info.temp_token_account_pubkey = *temp_token_account.key;
        escrow_info.initializer_token_to_receive_account_pubkey = *token_to_receive_account.key;
        escrow_info.expected_amount = amount;

        Escrow::pack(escrow_info, &mut escrow_account.try_borrow_mut_data()?)?;

        let token_program = next_account_info(account_info_iter)?;
        check_token_program(token_program)?;
        // Hand the temp account to the PDA, signed by the initializer
        let owner_change_ix = spl_token::instruction::set_authority(
            token_program.key,      // token program moves the authority
            temp_token_account.key, // of the temp token account
            Some(&pda),             // to the escrow's derived address
            spl_token::instruction::AuthorityType::AccountOwner,
            initializer.key,
            &[initializer.key],
        )?;

        msg!("Calling the token program to transfer token account ownership...");
        invoke(
            &owner_change_ix,
            &[
                temp_token_account.clone(),
                initializer.clone(),
                token_program.clone(),
            ],
        )?;

        Ok(())
    }

    fn process_exchange(
        accounts: &[AccountInfo],
        amount_expected_by_taker: u64,
        program_id: &Pubkey,
    ) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        // This time the taker is the signer
        let taker = next_account_info(account_info_iter)?;

        if !taker.is_signer {
            return Err(EscrowError::Unauthorized.into());
        }

        // Taker's token Y account
        let takers_sending_token_account = next_account_info(account_info_iter)?;
        // Taker's token X account
        let takers_token_to_receive_account = next_account_info(account_info_iter)?;
        // Initializer's temp token X account, owned by the PDA
        let pdas_temp_token_account = next_account_info(account_info_iter)?;
        // Initializer's main account, receives the rent of both closed accounts
        let initializers_main_account = next_account_info(account_info_iter)?;
        // Initializer's token Y account
        let initializers_token_to_receive_account = next_account_info(account_info_iter)?;
        // Escrow state account
        let escrow_account = next_account_info(account_info_iter)?;

        // The record is read before any token account so that a settled or
        // cancelled escrow always surfaces as NotInitialized.
        let escrow_info = load_initialized_escrow(escrow_account, program_id)?;

        // Every account bound at Initialize must be the one supplied now.
        if escrow_info.temp_token_account_pubkey != *pdas_temp_token_account.key {
            return Err(EscrowError::AccountMismatch.into());
        }
        if escrow_info.initializer_pubkey != *initializers_main_account.key {
            return Err(EscrowError::AccountMismatch.into());
        }
        if escrow_info.initializer_token_to_receive_account_pubkey
            != *initializers_token_to_receive_account.key
        {
            return Err(EscrowError::AccountMismatch.into());
        }

        let token_program = next_account_info(account_info_iter)?;
        check_token_program(token_program)?;
        let pda_account = next_account_info(account_info_iter)?;
        let (pda, bump_seed) = crate::escrow_authority(program_id);
        if *pda_account.key != pda {
            return Err(EscrowError::AccountMismatch.into());
        }

        let pdas_temp_token_account_info =
            TokenAccount::unpack(&pdas_temp_token_account.try_borrow_data()?)?;
        assert_token_owner(&pdas_temp_token_account_info, &pda)?;

        // The amount held and the amount the taker expects to receive must be the same
        if amount_expected_by_taker != pdas_temp_token_account_info.amount {
            return Err(EscrowError::ExpectedAmountMismatch.into());
        }

        // Token X can only land in an account of the held mint.
        let takers_token_to_receive_account_info =
            TokenAccount::unpack(&takers_token_to_receive_account.try_borrow_data()?)?;
        if takers_token_to_receive_account_info.mint != pdas_temp_token_account_info.mint {
            return Err(EscrowError::AccountMismatch.into());
        }

        let takers_sending_token_account_info =
            TokenAccount::unpack(&takers_sending_token_account.try_borrow_data()?)?;
        if takers_sending_token_account_info.amount < escrow_info.expected_amount {
            return Err(EscrowError::InsufficientBalance.into());
        }

        let transfer_to_initializer_ix = spl_token::instruction::transfer(
            token_program.key,
            takers_sending_token_account.key,          // from the taker's token Y account
            initializers_token_to_receive_account.key, // to the initializer's token Y account
            taker.key,                                 // authorized by the taker
            &[taker.key],
            escrow_info.expected_amount,
        )?;
        msg!("Calling the token program to transfer tokens to the escrow's initializer...");
        invoke(
            &transfer_to_initializer_ix,
            &[
                takers_sending_token_account.clone(),
                initializers_token_to_receive_account.clone(),
                taker.clone(),
                token_program.clone(),
            ],
        )?;

        let bump = [bump_seed];
        let signer_seeds: &[&[u8]] = &[ESCROW_SEED, &bump];

        let transfer_to_taker_ix = spl_token::instruction::transfer(
            token_program.key,
            pdas_temp_token_account.key,         // from the temp token X account
            takers_token_to_receive_account.key, // to the taker's token X account
            &pda,                                // authorized by the PDA
            &[&pda],
            pdas_temp_token_account_info.amount, // everything that was deposited
        )?;
        // The PDA has no private key, so it signs with its seeds.
        msg!("Calling the token program to transfer tokens to the taker...");
        invoke_signed(
            &transfer_to_taker_ix,
            &[
                pdas_temp_token_account.clone(),
                takers_token_to_receive_account.clone(),
                pda_account.clone(),
                token_program.clone(),
            ],
            &[signer_seeds],
        )?;

        // Temp account is empty now; its rent goes back to the initializer.
        close_temp_token_account(
            token_program,
            pdas_temp_token_account,
            initializers_main_account,
            pda_account,
            signer_seeds,
        )?;

        msg!("Closing the escrow account...");
        close_escrow_account(escrow_account, initializers_main_account)
    }

    fn process_cancel(accounts: &[AccountInfo], program_id: &Pubkey) -> ProgramResult {
        let account_info_iter = &mut accounts.iter();
        // Only the initializer may call off the trade
        let initializer = next_account_info(account_info_iter)?;

        if !initializer.is_signer {
            return Err(EscrowError::Unauthorized.into());
        }

        // Temp token X account, owned by the PDA
        let pdas_temp_token_account = next_account_info(account_info_iter)?;
        // Initializer's token X account that gets the refund
        let initializers_token_account = next_account_info(account_info_iter)?;
        // Escrow state account
        let escrow_account = next_account_info(account_info_iter)?;

        let escrow_info = load_initialized_escrow(escrow_account, program_id)?;

        if escrow_info.initializer_pubkey != *initializer.key {
            return Err(EscrowError::AccountMismatch.into());
        }
        if escrow_info.temp_token_account_pubkey != *pdas_temp_token_account.key {
            return Err(EscrowError::AccountMismatch.into());
        }

        let token_program = next_account_info(account_info_iter)?;
        check_token_program(token_program)?;
        let pda_account = next_account_info(account_info_iter)?;
        let (pda, bump_seed) = crate::escrow_authority(program_id);
        if *pda_account.key != pda {
            return Err(EscrowError::AccountMismatch.into());
        }

        let pdas_temp_token_account_info =
            TokenAccount::unpack(&pdas_temp_token_account.try_borrow_data()?)?;
        assert_token_owner(&pdas_temp_token_account_info, &pda)?;

        // Refunds may only land in a token account the initializer controls.
        let initializers_token_account_info =
            TokenAccount::unpack(&initializers_token_account.try_borrow_data()?)?;
        assert_token_owner(&initializers_token_account_info, initializer.key)?;
        if initializers_token_account_info.mint != pdas_temp_token_account_info.mint {
            return Err(EscrowError::AccountMismatch.into());
        }

        let bump = [bump_seed];
        let signer_seeds: &[&[u8]] = &[ESCROW_SEED, &bump];

        let refund_ix = spl_token::instruction::transfer(
            token_program.key,
            pdas_temp_token_account.key,    // from the temp token X account
            initializers_token_account.key, // back to the initializer
            &pda,                           // authorized by the PDA
            &[&pda],
            pdas_temp_token_account_info.amount,
        )?;
        msg!("Calling the token program to return tokens to the initializer...");
        invoke_signed(
            &refund_ix,
            &[
                pdas_temp_token_account.clone(),
                initializers_token_account.clone(),
                pda_account.clone(),
                token_program.clone(),
            ],
            &[signer_seeds],
        )?;

        close_temp_token_account(
            token_program,
            pdas_temp_token_account,
            initializer,
            pda_account,
            signer_seeds,
        )?;

        msg!("Closing the escrow account...");
        close_escrow_account(escrow_account, initializer)
    }
}

/// Reads the escrow record, treating a closed account as an uninitialized one.
fn load_initialized_escrow(
    escrow_account: &AccountInfo,
    program_id: &Pubkey,
) -> Result<Escrow, ProgramError> {
    if escrow_account.lamports() == 0 || escrow_account.data_is_empty() {
        return Err(EscrowError::NotInitialized.into());
    }
    if escrow_account.owner != program_id {
        return Err(ProgramError::IncorrectProgramId);
    }

    let escrow_info = Escrow::decode(&escrow_account.try_borrow_data()?)?;
    if !escrow_info.is_initialized {
        return Err(EscrowError::NotInitialized.into());
    }
    Ok(escrow_info)
}

/// Custody check: the token account's owner field is the only authority that can move its funds.
fn assert_token_owner(account: &TokenAccount, expected_owner: &Pubkey) -> ProgramResult {
    if account.owner != *expected_owner {
        return Err(EscrowError::AccountMismatch.into());
    }
    Ok(())
}

fn check_token_program(token_program: &AccountInfo) -> ProgramResult {
    if *token_program.key != spl_token::id() {
        return Err(ProgramError::IncorrectProgramId);
    }
    Ok(())
}

fn close_temp_token_account<'a>(
    token_program: &AccountInfo<'a>,
    pdas_temp_token_account: &AccountInfo<'a>,
    destination: &AccountInfo<'a>,
    pda_account: &AccountInfo<'a>,
    signer_seeds: &[&[u8]],
) -> ProgramResult {
    let close_pdas_temp_acc_ix = spl_token::instruction::close_account(
        token_program.key,
        pdas_temp_token_account.key,
        destination.key,
        pda_account.key,
        &[pda_account.key],
    )?;
    msg!("Calling the token program to close pda's temp account...");
    invoke_signed(
        &close_pdas_temp_acc_ix,
        &[
            pdas_temp_token_account.clone(),
            destination.clone(),
            pda_account.clone(),
            token_program.clone(),
        ],
        &[signer_seeds],
    )
}

/// Moves the escrow account's lamports to `destination` and zeroes its data,
/// which leaves the record uninitialized and lets the runtime reclaim the account.
fn close_escrow_account(escrow_account: &AccountInfo, destination: &AccountInfo) -> ProgramResult {
    **destination.lamports.borrow_mut() = destination
        .lamports()
        .checked_add(escrow_account.lamports())
        .ok_or(EscrowError::AmountOverflow)?;
    **escrow_account.lamports.borrow_mut() = 0;
    escrow_account.try_borrow_mut_data()?.fill(0);
    Ok(())
}
