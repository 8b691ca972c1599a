use crate::VaultError;
use ethers::abi::{ParamType, Token};
use ethers::types::{Address, U256};
use std::collections::BTreeMap;
use thiserror::Error;

/// One budget rule: bounds spend of `token` to `budget` per `time_window`
/// seconds, optionally filtered by recipient lists.
///
/// The whitelist and blacklist are independent filters; the blacklist wins
/// when a recipient appears in both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendingRule {
    pub token: Address,
    /// Length of one budget period, in seconds. Must be > 0.
    pub time_window: u64,
    /// Maximum cumulative spend within one window, in base token units.
    pub budget: U256,
    /// UNIX timestamp anchoring window 0.
    pub initial_window_start_time: u64,
    /// If non-empty, only these recipients may receive funds.
    pub whitelist: Vec<Address>,
    /// If non-empty, these recipients are always rejected.
    pub blacklist: Vec<Address>,
}

impl SpendingRule {
    /// Window index for time `t`, or `None` when `t` precedes window 0.
    ///
    /// A spend at exactly `start + k * window` belongs to window `k`.
    pub fn window_index(&self, t: u64) -> Option<u64> {
        if t < self.initial_window_start_time {
            return None;
        }
        Some((t - self.initial_window_start_time) / self.time_window)
    }

    fn recipient_allowed(&self, recipient: Address) -> bool {
        if self.blacklist.contains(&recipient) {
            return false;
        }
        self.whitelist.is_empty() || self.whitelist.contains(&recipient)
    }

    /// ABI tuple type of the on-chain rule struct:
    /// `(address,uint256,uint256,uint256,address[],address[])`.
    pub fn abi_param_type() -> ParamType {
        ParamType::Tuple(vec![
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Array(Box::new(ParamType::Address)),
            ParamType::Array(Box::new(ParamType::Address)),
        ])
    }

    pub fn to_abi_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.token),
            Token::Uint(U256::from(self.time_window)),
            Token::Uint(self.budget),
            Token::Uint(U256::from(self.initial_window_start_time)),
            Token::Array(self.whitelist.iter().copied().map(Token::Address).collect()),
            Token::Array(self.blacklist.iter().copied().map(Token::Address).collect()),
        ])
    }

    /// Decode one rule from its ABI tuple, as returned by the vault's
    /// `getSpendingRules()` view.
    pub fn from_abi_token(token: &Token) -> Result<Self, VaultError> {
        let bad = || VaultError::InvalidRule("malformed rule tuple".to_string());

        let Token::Tuple(fields) = token else {
            return Err(bad());
        };
        if fields.len() != 6 {
            return Err(bad());
        }

        let token_addr = fields[0].clone().into_address().ok_or_else(bad)?;
        let time_window = uint_to_u64(&fields[1]).ok_or_else(|| {
            VaultError::InvalidRule("time window does not fit in u64 seconds".to_string())
        })?;
        let budget = fields[2].clone().into_uint().ok_or_else(bad)?;
        let start = uint_to_u64(&fields[3]).ok_or_else(|| {
            VaultError::InvalidRule("window start does not fit in a u64 timestamp".to_string())
        })?;
        let whitelist = address_array(&fields[4]).ok_or_else(bad)?;
        let blacklist = address_array(&fields[5]).ok_or_else(bad)?;

        Ok(Self {
            token: token_addr,
            time_window,
            budget,
            initial_window_start_time: start,
            whitelist,
            blacklist,
        })
    }
}

fn uint_to_u64(token: &Token) -> Option<u64> {
    let v = token.clone().into_uint()?;
    if v > U256::from(u64::MAX) {
        return None;
    }
    Some(v.as_u64())
}

fn address_array(token: &Token) -> Option<Vec<Address>> {
    let Token::Array(items) = token else {
        return None;
    };
    items.iter().map(|t| t.clone().into_address()).collect()
}

/// Why a spend was denied by the ledger.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SpendDenied {
    /// No active rule governs this token; spends are denied by default.
    #[error("no spending rule configured for token {token:?}")]
    NoRuleConfigured { token: Address },

    /// The spend precedes the rule's first window.
    #[error("spend at {at} precedes the initial window start {start}")]
    WindowNotStarted { at: u64, start: u64 },

    /// The recipient is blacklisted, or absent from a non-empty whitelist.
    #[error("recipient {recipient:?} not allowed by the active rule")]
    RecipientNotAllowed { recipient: Address },

    /// The spend would push the window's cumulative total past the budget.
    #[error("budget exceeded in window {window}: spent {spent} + {amount} > {budget}")]
    BudgetExceeded {
        window: u64,
        spent: U256,
        amount: U256,
        budget: U256,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct WindowSpend {
    window_index: u64,
    spent: U256,
}

/// Off-chain mirror of the vault's spending-rule state.
///
/// Rules are replaced as a whole set, which resets all window accounting,
/// matching what the on-chain `configureSpendingRules` does. The ledger is
/// fail-closed: a token with no rule cannot be spent.
#[derive(Debug, Clone, Default)]
pub struct RuleLedger {
    rules: Vec<SpendingRule>,
    spent: BTreeMap<Address, WindowSpend>,
}

impl RuleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entire rule set and reset all window accounting.
    ///
    /// Rejects windows of zero length and payloads that name the same token
    /// twice (the replacement would be ambiguous).
    pub fn configure_rules(&mut self, rules: Vec<SpendingRule>) -> Result<(), VaultError> {
        let mut seen = BTreeMap::new();
        for rule in &rules {
            if rule.time_window == 0 {
                return Err(VaultError::InvalidRule(format!(
                    "time window must be > 0 (token {:?})",
                    rule.token
                )));
            }
            if seen.insert(rule.token, ()).is_some() {
                return Err(VaultError::DuplicateToken(rule.token));
            }
        }

        self.rules = rules;
        self.spent.clear();
        Ok(())
    }

    pub fn rules(&self) -> &[SpendingRule] {
        &self.rules
    }

    pub fn rule_for(&self, token: Address) -> Option<&SpendingRule> {
        self.rules.iter().find(|r| r.token == token)
    }

    /// Cumulative spend recorded for `token` in the window active at `now`.
    pub fn spent_in_window(&self, token: Address, now: u64) -> U256 {
        let Some(rule) = self.rule_for(token) else {
            return U256::zero();
        };
        let Some(window) = rule.window_index(now) else {
            return U256::zero();
        };
        match self.spent.get(&token) {
            Some(ws) if ws.window_index == window => ws.spent,
            _ => U256::zero(),
        }
    }

    /// Would a spend of `amount` to `recipient` pass the active rule at `now`?
    pub fn evaluate_spend(
        &self,
        token: Address,
        amount: U256,
        recipient: Address,
        now: u64,
    ) -> Result<(), SpendDenied> {
        let rule = self
            .rule_for(token)
            .ok_or(SpendDenied::NoRuleConfigured { token })?;

        let window = rule
            .window_index(now)
            .ok_or(SpendDenied::WindowNotStarted {
                at: now,
                start: rule.initial_window_start_time,
            })?;

        if !rule.recipient_allowed(recipient) {
            return Err(SpendDenied::RecipientNotAllowed { recipient });
        }

        let spent = self.spent_in_window(token, now);
        let total = spent.checked_add(amount).ok_or(SpendDenied::BudgetExceeded {
            window,
            spent,
            amount,
            budget: rule.budget,
        })?;
        if total > rule.budget {
            return Err(SpendDenied::BudgetExceeded {
                window,
                spent,
                amount,
                budget: rule.budget,
            });
        }

        Ok(())
    }

    /// Boolean mirror of the contract's `checkSpendAllowed` view: false,
    /// never an error, when no rule exists for the token.
    pub fn check_spend_allowed(
        &self,
        token: Address,
        amount: U256,
        recipient: Address,
        now: u64,
    ) -> bool {
        self.evaluate_spend(token, amount, recipient, now).is_ok()
    }

    /// Validate and account a spend at `now`.
    ///
    /// Re-evaluates at execution time rather than trusting any earlier
    /// check, then increments the active window's total. Denials leave the
    /// ledger unchanged.
    pub fn record_spend(
        &mut self,
        token: Address,
        amount: U256,
        recipient: Address,
        now: u64,
    ) -> Result<(), SpendDenied> {
        self.evaluate_spend(token, amount, recipient, now)?;

        // evaluate_spend guarantees the rule and window exist.
        let Some(window) = self.rule_for(token).and_then(|r| r.window_index(now)) else {
            return Err(SpendDenied::NoRuleConfigured { token });
        };

        let entry = self.spent.entry(token).or_default();
        if entry.window_index != window {
            entry.window_index = window;
            entry.spent = U256::zero();
        }
        entry.spent += amount;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    fn rule(token: Address, window: u64, budget: u64, start: u64) -> SpendingRule {
        SpendingRule {
            token,
            time_window: window,
            budget: U256::from(budget),
            initial_window_start_time: start,
            whitelist: vec![],
            blacklist: vec![],
        }
    }

    fn ledger_with(rules: Vec<SpendingRule>) -> RuleLedger {
        let mut ledger = RuleLedger::new();
        ledger.configure_rules(rules).unwrap();
        ledger
    }

    #[test]
    fn spends_up_to_budget_succeed_and_overspend_fails() {
        let t = addr(1);
        let mut ledger = ledger_with(vec![rule(t, 3600, 100, 1000)]);

        ledger.record_spend(t, U256::from(60), addr(9), 1500).unwrap();
        ledger.record_spend(t, U256::from(40), addr(9), 1600).unwrap();
        assert_eq!(ledger.spent_in_window(t, 1600), U256::from(100));

        let err = ledger
            .record_spend(t, U256::from(1), addr(9), 1700)
            .unwrap_err();
        assert!(matches!(err, SpendDenied::BudgetExceeded { .. }));
        // Denial left the accounting untouched.
        assert_eq!(ledger.spent_in_window(t, 1700), U256::from(100));
    }

    #[test]
    fn exact_window_boundary_belongs_to_the_new_window() {
        let t = addr(1);
        let mut ledger = ledger_with(vec![rule(t, 3600, 100, 1000)]);

        ledger.record_spend(t, U256::from(100), addr(9), 1000).unwrap();

        // t = start + W: window 1, budget fresh regardless of window 0's total.
        let r = ledger.rule_for(t).unwrap();
        assert_eq!(r.window_index(4599), Some(0));
        assert_eq!(r.window_index(4600), Some(1));
        ledger.record_spend(t, U256::from(100), addr(9), 4600).unwrap();
    }

    #[test]
    fn no_rule_means_denied_not_error() {
        let ledger = ledger_with(vec![rule(addr(1), 3600, 100, 0)]);

        assert!(!ledger.check_spend_allowed(addr(2), U256::from(1), addr(9), 10));
        assert!(matches!(
            ledger.evaluate_spend(addr(2), U256::from(1), addr(9), 10),
            Err(SpendDenied::NoRuleConfigured { .. })
        ));
    }

    #[test]
    fn spend_before_window_zero_is_denied() {
        let ledger = ledger_with(vec![rule(addr(1), 3600, 100, 1000)]);
        assert!(matches!(
            ledger.evaluate_spend(addr(1), U256::from(1), addr(9), 999),
            Err(SpendDenied::WindowNotStarted { at: 999, start: 1000 })
        ));
    }

    #[test]
    fn zero_budget_rejects_any_nonzero_spend() {
        let ledger = ledger_with(vec![rule(addr(1), 3600, 0, 0)]);
        assert!(!ledger.check_spend_allowed(addr(1), U256::from(1), addr(9), 10));
        assert!(ledger.check_spend_allowed(addr(1), U256::zero(), addr(9), 10));
    }

    #[test]
    fn blacklist_wins_even_when_recipient_is_whitelisted() {
        let t = addr(1);
        let r = addr(66);
        let mut sr = rule(t, 3600, 100, 0);
        sr.whitelist = vec![r, addr(7)];
        sr.blacklist = vec![r];
        let ledger = ledger_with(vec![sr]);

        assert!(matches!(
            ledger.evaluate_spend(t, U256::from(1), r, 10),
            Err(SpendDenied::RecipientNotAllowed { .. })
        ));
        assert!(ledger.check_spend_allowed(t, U256::from(1), addr(7), 10));
    }

    #[test]
    fn nonempty_whitelist_is_members_only() {
        let t = addr(1);
        let mut sr = rule(t, 3600, 100, 0);
        sr.whitelist = vec![addr(7)];
        let ledger = ledger_with(vec![sr]);

        assert!(ledger.check_spend_allowed(t, U256::from(1), addr(7), 10));
        assert!(!ledger.check_spend_allowed(t, U256::from(1), addr(8), 10));
    }

    #[test]
    fn worked_scenario_from_the_rule_model() {
        // rule: window 3600, budget 100, start 1000, blacklist [R]
        let t = addr(1);
        let r = addr(66);
        let x = addr(77);
        let mut sr = rule(t, 3600, 100, 1000);
        sr.blacklist = vec![r];
        let mut ledger = ledger_with(vec![sr]);

        assert!(matches!(
            ledger.record_spend(t, U256::from(50), r, 1500),
            Err(SpendDenied::RecipientNotAllowed { .. })
        ));

        ledger.record_spend(t, U256::from(50), x, 1500).unwrap();
        assert_eq!(ledger.spent_in_window(t, 1500), U256::from(50));

        assert!(matches!(
            ledger.record_spend(t, U256::from(60), x, 1600),
            Err(SpendDenied::BudgetExceeded { .. })
        ));

        // Next window: fresh budget.
        ledger.record_spend(t, U256::from(60), x, 4700).unwrap();
        assert_eq!(ledger.spent_in_window(t, 4700), U256::from(60));
    }

    #[test]
    fn reconfiguring_rules_resets_window_accounting() {
        let t = addr(1);
        let mut ledger = ledger_with(vec![rule(t, 3600, 100, 0)]);
        ledger.record_spend(t, U256::from(80), addr(9), 10).unwrap();

        ledger
            .configure_rules(vec![rule(t, 3600, 100, 0)])
            .unwrap();
        assert_eq!(ledger.spent_in_window(t, 10), U256::zero());
        ledger.record_spend(t, U256::from(100), addr(9), 20).unwrap();
    }

    #[test]
    fn empty_rule_set_spends_nothing() {
        let t = addr(1);
        let mut ledger = ledger_with(vec![rule(t, 3600, 100, 0)]);
        ledger.configure_rules(vec![]).unwrap();
        assert!(!ledger.check_spend_allowed(t, U256::from(1), addr(9), 10));
    }

    #[test]
    fn abi_tuple_roundtrip_preserves_every_field() {
        let mut sr = rule(addr(1), 3600, 100, 1000);
        sr.whitelist = vec![addr(7)];
        sr.blacklist = vec![addr(8), addr(9)];

        let decoded = SpendingRule::from_abi_token(&sr.to_abi_token()).unwrap();
        assert_eq!(decoded, sr);
    }

    #[test]
    fn malformed_rule_tuples_are_rejected() {
        assert!(SpendingRule::from_abi_token(&ethers::abi::Token::Bool(true)).is_err());
        assert!(SpendingRule::from_abi_token(&ethers::abi::Token::Tuple(vec![])).is_err());

        // timeWindow wider than u64 seconds is refused, not truncated.
        let mut fields = rule(addr(1), 1, 1, 0).to_abi_token();
        if let ethers::abi::Token::Tuple(ref mut f) = fields {
            f[1] = ethers::abi::Token::Uint(U256::MAX);
        }
        assert!(SpendingRule::from_abi_token(&fields).is_err());
    }

    #[test]
    fn invalid_rule_sets_are_rejected_whole() {
        let mut ledger = RuleLedger::new();

        let err = ledger
            .configure_rules(vec![rule(addr(1), 0, 100, 0)])
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidRule(_)));

        let err = ledger
            .configure_rules(vec![rule(addr(1), 10, 100, 0), rule(addr(1), 20, 50, 0)])
            .unwrap_err();
        assert!(matches!(err, VaultError::DuplicateToken(_)));

        // A rejected payload leaves the previous (empty) set in place.
        assert!(ledger.rules().is_empty());
    }
}
