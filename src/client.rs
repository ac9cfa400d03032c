//! Operation Builder.
//!
//! Turns one escrow transition into the ordered list of ledger operations it
//! needs, submits them as a single atomic batch and reads back the result.
//! Nothing here retries: a rejected batch is reported once and the caller
//! decides whether to re-read state and try again.

use async_trait::async_trait;
use solana_program::{
    instruction::{Instruction, InstructionError},
    program_error::ProgramError,
    program_pack::Pack,
    pubkey::Pubkey,
    system_instruction,
};
use solana_sdk::{
    signature::{Keypair, Signer},
    transaction::TransactionError,
};
use spl_token::{error::TokenError, state::Account as TokenAccount};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{error::EscrowError, instruction, state::Escrow};

/// What a ledger adapter reports when it cannot commit or read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("transaction rejected: {0}")]
    Transaction(#[from] TransactionError),
    #[error("ledger transport failed: {0}")]
    Transport(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The batch was rejected by an escrow precondition.
    #[error("escrow rejected the batch: {0}")]
    Escrow(#[from] EscrowError),
    /// The ledger rejected the batch for a reason outside the escrow contract.
    #[error("batch aborted: {0}")]
    BatchAborted(TransactionError),
    #[error("escrow account {0} still exists after a terminal transition")]
    NotClosed(Pubkey),
    #[error("could not build batch: {0}")]
    Build(#[from] ProgramError),
    #[error("ledger unavailable: {0}")]
    Transport(String),
}

impl From<LedgerError> for ClientError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Transaction(err) => ClientError::BatchAborted(err),
            LedgerError::Transport(msg) => ClientError::Transport(msg),
        }
    }
}

/// Host ledger services the builder depends on.
#[async_trait]
pub trait Ledger {
    /// Submits `instructions` as one transaction paid for by `payer`; `signers` must include the payer.
    async fn submit_batch(
        &mut self,
        instructions: &[Instruction],
        payer: &Pubkey,
        signers: &[&Keypair],
    ) -> Result<(), LedgerError>;

    /// Returns `None` when the account does not exist.
    async fn get_account_data(&mut self, address: &Pubkey) -> Result<Option<Vec<u8>>, LedgerError>;

    async fn minimum_balance(&mut self, data_len: usize) -> Result<u64, LedgerError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    CreateAccount,
    InitializeTokenAccount,
    TokenTransfer,
    Escrow,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    pub kind: OperationKind,
    pub instruction: Instruction,
}

/// An ordered set of operations that commits or aborts as a whole.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    operations: Vec<Operation>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, kind: OperationKind, instruction: Instruction) -> Self {
        self.operations.push(Operation { kind, instruction });
        self
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn instructions(&self) -> Vec<Instruction> {
        self.operations
            .iter()
            .map(|op| op.instruction.clone())
            .collect()
    }

    /// Attributes a rejected submission to the operation that failed.
    pub fn classify(&self, err: LedgerError) -> ClientError {
        let tx_err = match err {
            LedgerError::Transaction(tx_err) => tx_err,
            LedgerError::Transport(msg) => return ClientError::Transport(msg),
        };

        if let TransactionError::InstructionError(index, InstructionError::Custom(code)) = &tx_err {
            let kind = self.operations.get(*index as usize).map(|op| op.kind);
            let escrow_err = match kind {
                Some(OperationKind::Escrow) => EscrowError::from_code(*code),
                Some(OperationKind::TokenTransfer)
                    if *code == TokenError::InsufficientFunds as u32 =>
                {
                    Some(EscrowError::InsufficientBalance)
                }
                _ => None,
            };
            if let Some(escrow_err) = escrow_err {
                return ClientError::Escrow(escrow_err);
            }
        }
        ClientError::BatchAborted(tx_err)
    }
}

/// Terms of a new trade, from the initializer's side.
#[derive(Clone, Copy, Debug)]
pub struct InitializeParams {
    /// Mint of token X, the deposited token.
    pub token_x_mint: Pubkey,
    /// Initializer's token X account the deposit is drawn from.
    pub initializer_token_x_account: Pubkey,
    pub deposit_amount: u64,
    /// Where token Y lands when the trade completes.
    pub initializer_token_y_account: Pubkey,
    pub expected_amount: u64,
}

/// Accounts created for a trade, as passed to [`initialize_batch`].
#[derive(Clone, Copy, Debug)]
pub struct NewEscrowAccounts {
    pub temp_token_account: Pubkey,
    pub temp_token_account_lamports: u64,
    pub escrow_account: Pubkey,
    pub escrow_account_lamports: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitializedEscrow {
    pub address: Pubkey,
    pub record: Escrow,
}

/// Builds the Initialize batch: the holding account is created, initialized and
/// funded before the escrow account is allocated and the escrow instruction runs.
pub fn initialize_batch(
    program_id: &Pubkey,
    initializer: &Pubkey,
    accounts: &NewEscrowAccounts,
    params: &InitializeParams,
) -> Result<Batch, ProgramError> {
    let token_program = spl_token::id();
    let batch = Batch::new()
        .push(
            OperationKind::CreateAccount,
            system_instruction::create_account(
                initializer,
                &accounts.temp_token_account,
                accounts.temp_token_account_lamports,
                TokenAccount::LEN as u64,
                &token_program,
            ),
        )
        .push(
            OperationKind::InitializeTokenAccount,
            spl_token::instruction::initialize_account(
                &token_program,
                &accounts.temp_token_account,
                &params.token_x_mint,
                initializer,
            )?,
        )
        .push(
            OperationKind::TokenTransfer,
            spl_token::instruction::transfer(
                &token_program,
                &params.initializer_token_x_account,
                &accounts.temp_token_account,
                initializer,
                &[],
                params.deposit_amount,
            )?,
        )
        .push(
            OperationKind::CreateAccount,
            system_instruction::create_account(
                initializer,
                &accounts.escrow_account,
                accounts.escrow_account_lamports,
                Escrow::LEN as u64,
                program_id,
            ),
        )
        .push(
            OperationKind::Escrow,
            instruction::init_escrow(
                program_id,
                initializer,
                &accounts.temp_token_account,
                &params.initializer_token_y_account,
                &accounts.escrow_account,
                params.expected_amount,
            )?,
        );
    Ok(batch)
}

/// Builds the Exchange batch against the terms the taker inspected.
pub fn exchange_batch(
    program_id: &Pubkey,
    taker: &Pubkey,
    taker_token_y_account: &Pubkey,
    taker_token_x_account: &Pubkey,
    escrow_address: &Pubkey,
    terms: &Escrow,
    expected_token_x_amount: u64,
) -> Result<Batch, ProgramError> {
    let ix = instruction::exchange(
        program_id,
        taker,
        taker_token_y_account,
        taker_token_x_account,
        &terms.temp_token_account_pubkey,
        &terms.initializer_pubkey,
        &terms.initializer_token_to_receive_account_pubkey,
        escrow_address,
        expected_token_x_amount,
    )?;
    Ok(Batch::new().push(OperationKind::Escrow, ix))
}

pub fn cancel_batch(
    program_id: &Pubkey,
    initializer: &Pubkey,
    initializer_token_x_account: &Pubkey,
    escrow_address: &Pubkey,
    terms: &Escrow,
) -> Result<Batch, ProgramError> {
    let ix = instruction::cancel(
        program_id,
        initializer,
        &terms.temp_token_account_pubkey,
        initializer_token_x_account,
        escrow_address,
    )?;
    Ok(Batch::new().push(OperationKind::Escrow, ix))
}

pub struct EscrowClient<L> {
    ledger: L,
    program_id: Pubkey,
}

impl<L: Ledger> EscrowClient<L> {
    pub fn new(ledger: L, program_id: Pubkey) -> Self {
        Self { ledger, program_id }
    }

    pub fn program_id(&self) -> &Pubkey {
        &self.program_id
    }

    pub fn ledger_mut(&mut self) -> &mut L {
        &mut self.ledger
    }

    /// Reads and decodes the escrow record at `address`, `None` if the account is gone.
    pub async fn fetch_escrow(&mut self, address: &Pubkey) -> Result<Option<Escrow>, ClientError> {
        match self.ledger.get_account_data(address).await? {
            Some(data) => Ok(Some(Escrow::decode(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn submit(
        &mut self,
        batch: &Batch,
        payer: &Keypair,
        signers: &[&Keypair],
    ) -> Result<(), ClientError> {
        debug!(operations = batch.operations().len(), payer = %payer.pubkey(), "submitting escrow batch");
        match self
            .ledger
            .submit_batch(&batch.instructions(), &payer.pubkey(), signers)
            .await
        {
            Ok(()) => {
                info!(operations = batch.operations().len(), "escrow batch committed");
                Ok(())
            }
            Err(err) => {
                let err = batch.classify(err);
                warn!(error = %err, "escrow batch aborted");
                Err(err)
            }
        }
    }

    /// Creates, funds and registers a new trade in one batch.
    pub async fn initialize(
        &mut self,
        initializer: &Keypair,
        params: &InitializeParams,
    ) -> Result<InitializedEscrow, ClientError> {
        let temp_token_account = Keypair::new();
        let escrow_account = Keypair::new();
        let accounts = NewEscrowAccounts {
            temp_token_account: temp_token_account.pubkey(),
            temp_token_account_lamports: self.ledger.minimum_balance(TokenAccount::LEN).await?,
            escrow_account: escrow_account.pubkey(),
            escrow_account_lamports: self.ledger.minimum_balance(Escrow::LEN).await?,
        };

        let batch = initialize_batch(&self.program_id, &initializer.pubkey(), &accounts, params)?;
        self.submit(
            &batch,
            initializer,
            &[initializer, &temp_token_account, &escrow_account],
        )
        .await?;

        let record = self
            .fetch_escrow(&accounts.escrow_account)
            .await?
            .filter(|record| record.is_initialized)
            .ok_or(EscrowError::NotInitialized)?;
        info!(escrow = %accounts.escrow_account, expected_amount = record.expected_amount, "escrow initialized");

        Ok(InitializedEscrow {
            address: accounts.escrow_account,
            record,
        })
    }

    /// Settles the trade described by `terms`, which the taker read from `escrow_address`.
    pub async fn exchange(
        &mut self,
        taker: &Keypair,
        taker_token_y_account: &Pubkey,
        taker_token_x_account: &Pubkey,
        escrow_address: &Pubkey,
        terms: &Escrow,
        expected_token_x_amount: u64,
    ) -> Result<(), ClientError> {
        let batch = exchange_batch(
            &self.program_id,
            &taker.pubkey(),
            taker_token_y_account,
            taker_token_x_account,
            escrow_address,
            terms,
            expected_token_x_amount,
        )?;
        self.submit(&batch, taker, &[taker]).await?;
        self.ensure_closed(escrow_address).await
    }

    pub async fn cancel(
        &mut self,
        initializer: &Keypair,
        initializer_token_x_account: &Pubkey,
        escrow_address: &Pubkey,
        terms: &Escrow,
    ) -> Result<(), ClientError> {
        let batch = cancel_batch(
            &self.program_id,
            &initializer.pubkey(),
            initializer_token_x_account,
            escrow_address,
            terms,
        )?;
        self.submit(&batch, initializer, &[initializer]).await?;
        self.ensure_closed(escrow_address).await
    }

    async fn ensure_closed(&mut self, escrow_address: &Pubkey) -> Result<(), ClientError> {
        if self.ledger.get_account_data(escrow_address).await?.is_some() {
            return Err(ClientError::NotClosed(*escrow_address));
        }
        info!(escrow = %escrow_address, "escrow closed");
        Ok(())
    }
}
