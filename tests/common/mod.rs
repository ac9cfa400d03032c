#![allow(dead_code)]

use async_trait::async_trait;
use solana_escrow::{
    client::{
        Batch, EscrowClient, InitializeParams, InitializedEscrow, Ledger, LedgerError,
        OperationKind,
    },
    processor::Processor,
    state::Escrow,
};
use solana_program::{
    instruction::Instruction, program_option::COption, program_pack::Pack, pubkey::Pubkey,
    rent::Rent, system_instruction, system_program,
};
use solana_program_test::{processor, BanksClient, BanksClientError, ProgramTest};
use solana_sdk::{
    account::Account,
    signature::{Keypair, Signer},
    transaction::Transaction,
};
use spl_token::state::{Account as TokenAccount, AccountState, Mint};

pub const DEPOSIT: u64 = 100;
pub const EXPECTED: u64 = 50;

#[derive(Clone)]
pub struct BanksLedger {
    banks_client: BanksClient,
}

fn transport(err: BanksClientError) -> LedgerError {
    LedgerError::Transport(err.to_string())
}

#[async_trait]
impl Ledger for BanksLedger {
    async fn submit_batch(
        &mut self,
        instructions: &[Instruction],
        payer: &Pubkey,
        signers: &[&Keypair],
    ) -> Result<(), LedgerError> {
        let blockhash = self
            .banks_client
            .get_latest_blockhash()
            .await
            .map_err(transport)?;
        let mut transaction = Transaction::new_with_payer(instructions, Some(payer));
        transaction
            .try_sign(signers, blockhash)
            .map_err(|err| LedgerError::Transport(err.to_string()))?;

        match self.banks_client.process_transaction(transaction).await {
            Ok(()) => Ok(()),
            Err(BanksClientError::TransactionError(err))
            | Err(BanksClientError::SimulationError { err, .. }) => {
                Err(LedgerError::Transaction(err))
            }
            Err(other) => Err(transport(other)),
        }
    }

    async fn get_account_data(&mut self, address: &Pubkey) -> Result<Option<Vec<u8>>, LedgerError> {
        let account = self
            .banks_client
            .get_account(*address)
            .await
            .map_err(transport)?;
        Ok(account
            .filter(|account| account.lamports > 0)
            .map(|account| account.data))
    }

    async fn minimum_balance(&mut self, data_len: usize) -> Result<u64, LedgerError> {
        let rent = self.banks_client.get_rent().await.map_err(transport)?;
        Ok(rent.minimum_balance(data_len))
    }
}

/// Two parties, two mints and their token accounts, loaded into a fresh bank.
pub struct Market {
    pub client: EscrowClient<BanksLedger>,
    pub alice: Keypair,
    pub bob: Keypair,
    pub mint_x: Pubkey,
    pub mint_y: Pubkey,
    pub alice_x: Pubkey,
    pub alice_y: Pubkey,
    pub bob_x: Pubkey,
    pub bob_y: Pubkey,
}

fn wallet() -> Account {
    Account::new(10_000_000_000, 0, &system_program::id())
}

fn mint_account(authority: &Pubkey) -> Account {
    let mut data = vec![0u8; Mint::LEN];
    let mint = Mint {
        mint_authority: COption::Some(*authority),
        supply: 1_000_000,
        decimals: 0,
        is_initialized: true,
        freeze_authority: COption::None,
    };
    Mint::pack(mint, &mut data).unwrap();
    Account {
        lamports: Rent::default().minimum_balance(Mint::LEN),
        data,
        owner: spl_token::id(),
        executable: false,
        rent_epoch: 0,
    }
}

fn token_account(mint: &Pubkey, owner: &Pubkey, amount: u64) -> Account {
    let mut data = vec![0u8; TokenAccount::LEN];
    let account = TokenAccount {
        mint: *mint,
        owner: *owner,
        amount,
        state: AccountState::Initialized,
        ..TokenAccount::default()
    };
    TokenAccount::pack(account, &mut data).unwrap();
    Account {
        lamports: Rent::default().minimum_balance(TokenAccount::LEN),
        data,
        owner: spl_token::id(),
        executable: false,
        rent_epoch: 0,
    }
}

impl Market {
    pub async fn start(alice_x_amount: u64, bob_y_amount: u64) -> Self {
        let mut program_test = ProgramTest::new(
            "solana_escrow",
            solana_escrow::id(),
            processor!(Processor::process),
        );

        let alice = Keypair::new();
        let bob = Keypair::new();
        let mint_authority = Pubkey::new_unique();
        let (mint_x, mint_y) = (Pubkey::new_unique(), Pubkey::new_unique());
        let (alice_x, alice_y) = (Pubkey::new_unique(), Pubkey::new_unique());
        let (bob_x, bob_y) = (Pubkey::new_unique(), Pubkey::new_unique());

        program_test.add_account(alice.pubkey(), wallet());
        program_test.add_account(bob.pubkey(), wallet());
        program_test.add_account(mint_x, mint_account(&mint_authority));
        program_test.add_account(mint_y, mint_account(&mint_authority));
        program_test.add_account(alice_x, token_account(&mint_x, &alice.pubkey(), alice_x_amount));
        program_test.add_account(alice_y, token_account(&mint_y, &alice.pubkey(), 0));
        program_test.add_account(bob_x, token_account(&mint_x, &bob.pubkey(), 0));
        program_test.add_account(bob_y, token_account(&mint_y, &bob.pubkey(), bob_y_amount));

        let (banks_client, _payer, _recent_blockhash) = program_test.start().await;
        let client = EscrowClient::new(BanksLedger { banks_client }, solana_escrow::id());

        Market {
            client,
            alice,
            bob,
            mint_x,
            mint_y,
            alice_x,
            alice_y,
            bob_x,
            bob_y,
        }
    }

    pub fn offer(&self, deposit_amount: u64, expected_amount: u64) -> InitializeParams {
        InitializeParams {
            token_x_mint: self.mint_x,
            initializer_token_x_account: self.alice_x,
            deposit_amount,
            initializer_token_y_account: self.alice_y,
            expected_amount,
        }
    }

    /// Alice deposits `DEPOSIT` of X asking for `EXPECTED` of Y.
    pub async fn open_trade(&mut self) -> InitializedEscrow {
        let params = self.offer(DEPOSIT, EXPECTED);
        self.client
            .initialize(&self.alice, &params)
            .await
            .expect("initialize")
    }

    /// Token balance, `None` once the account is closed.
    pub async fn balance(&mut self, address: &Pubkey) -> Option<u64> {
        self.token_account(address).await.map(|account| account.amount)
    }

    pub async fn token_account(&mut self, address: &Pubkey) -> Option<TokenAccount> {
        self.client
            .ledger_mut()
            .get_account_data(address)
            .await
            .unwrap()
            .map(|data| TokenAccount::unpack(&data).unwrap())
    }

    /// Creates `temp` as Alice's token X account and moves `amount` into it.
    pub async fn deposit_batch(&mut self, temp: &Pubkey, amount: u64) -> Batch {
        let lamports = self
            .client
            .ledger_mut()
            .minimum_balance(TokenAccount::LEN)
            .await
            .unwrap();
        let alice = self.alice.pubkey();
        let token_program = spl_token::id();

        Batch::new()
            .push(
                OperationKind::CreateAccount,
                system_instruction::create_account(
                    &alice,
                    temp,
                    lamports,
                    TokenAccount::LEN as u64,
                    &token_program,
                ),
            )
            .push(
                OperationKind::InitializeTokenAccount,
                spl_token::instruction::initialize_account(&token_program, temp, &self.mint_x, &alice)
                    .unwrap(),
            )
            .push(
                OperationKind::TokenTransfer,
                spl_token::instruction::transfer(
                    &token_program,
                    &self.alice_x,
                    temp,
                    &alice,
                    &[],
                    amount,
                )
                .unwrap(),
            )
    }

    /// Allocates an escrow account of `space` bytes funded with `lamports`, paid by Alice.
    pub fn create_escrow_account(&self, escrow: &Pubkey, lamports: u64, space: usize) -> Instruction {
        system_instruction::create_account(
            &self.alice.pubkey(),
            escrow,
            lamports,
            space as u64,
            &solana_escrow::id(),
        )
    }

    pub async fn escrow_rent(&mut self) -> u64 {
        self.client
            .ledger_mut()
            .minimum_balance(Escrow::LEN)
            .await
            .unwrap()
    }

    pub async fn balances(&mut self) -> [Option<u64>; 4] {
        let (alice_x, alice_y, bob_x, bob_y) = (self.alice_x, self.alice_y, self.bob_x, self.bob_y);
        [
            self.balance(&alice_x).await,
            self.balance(&alice_y).await,
            self.balance(&bob_x).await,
            self.balance(&bob_y).await,
        ]
    }
}
