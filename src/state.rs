//! Per-direction transaction state machines.
//!
//! Two deterministic automata, one per direction, encoded as constant
//! lookup tables over `(state, event)`. Pairs absent from a table are
//! rejected; a rejected event never mutates state. The caller decides
//! what a rejection means (for the transaction, a protocol error).

/// States of the ingress (receive) automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressState {
    Start,
    HeadersReceived,
    RegularBodyReceived,
    ChunkHeaderReceived,
    ChunkBodyReceived,
    ChunkCompleted,
    TrailersReceived,
    UpgradeComplete,
    EomQueued,
    ReceivingDone,
}

/// Events driving the ingress automaton. `EomFlushed` is internal: it
/// fires once the queued EOM has actually been delivered to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressEvent {
    OnHeaders,
    OnBody,
    OnChunkHeader,
    OnChunkComplete,
    OnTrailers,
    OnUpgrade,
    OnEom,
    EomFlushed,
}

/// States of the egress (send) automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressState {
    Start,
    HeadersSent,
    RegularBodySent,
    ChunkHeaderSent,
    ChunkBodySent,
    ChunkTerminatorSent,
    TrailersSent,
    EomQueued,
    SendingDone,
}

/// Events driving the egress automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressEvent {
    SendHeaders,
    SendBody,
    SendChunkHeader,
    SendChunkTerminator,
    SendTrailers,
    SendEom,
    EomFlushed,
}

const INGRESS_STATES: usize = 10;
const INGRESS_EVENTS: usize = 8;
const EGRESS_STATES: usize = 9;
const EGRESS_EVENTS: usize = 7;

type IngressTable = [[Option<IngressState>; INGRESS_EVENTS]; INGRESS_STATES];
type EgressTable = [[Option<EgressState>; EGRESS_EVENTS]; EGRESS_STATES];

const fn ingress_table() -> IngressTable {
    use IngressEvent as E;
    use IngressState as S;
    let mut t: IngressTable = [[None; INGRESS_EVENTS]; INGRESS_STATES];

    t[S::Start as usize][E::OnHeaders as usize] = Some(S::HeadersReceived);

    t[S::HeadersReceived as usize][E::OnBody as usize] = Some(S::RegularBodyReceived);
    t[S::HeadersReceived as usize][E::OnChunkHeader as usize] = Some(S::ChunkHeaderReceived);
    t[S::HeadersReceived as usize][E::OnTrailers as usize] = Some(S::TrailersReceived);
    t[S::HeadersReceived as usize][E::OnUpgrade as usize] = Some(S::UpgradeComplete);
    t[S::HeadersReceived as usize][E::OnEom as usize] = Some(S::EomQueued);

    t[S::RegularBodyReceived as usize][E::OnBody as usize] = Some(S::RegularBodyReceived);
    t[S::RegularBodyReceived as usize][E::OnTrailers as usize] = Some(S::TrailersReceived);
    t[S::RegularBodyReceived as usize][E::OnUpgrade as usize] = Some(S::UpgradeComplete);
    t[S::RegularBodyReceived as usize][E::OnEom as usize] = Some(S::EomQueued);

    t[S::ChunkHeaderReceived as usize][E::OnBody as usize] = Some(S::ChunkBodyReceived);
    t[S::ChunkHeaderReceived as usize][E::OnEom as usize] = Some(S::EomQueued);

    t[S::ChunkBodyReceived as usize][E::OnBody as usize] = Some(S::ChunkBodyReceived);
    t[S::ChunkBodyReceived as usize][E::OnChunkComplete as usize] = Some(S::ChunkCompleted);
    t[S::ChunkBodyReceived as usize][E::OnEom as usize] = Some(S::EomQueued);

    t[S::ChunkCompleted as usize][E::OnChunkHeader as usize] = Some(S::ChunkHeaderReceived);
    t[S::ChunkCompleted as usize][E::OnTrailers as usize] = Some(S::TrailersReceived);
    t[S::ChunkCompleted as usize][E::OnEom as usize] = Some(S::EomQueued);

    t[S::TrailersReceived as usize][E::OnTrailers as usize] = Some(S::TrailersReceived);
    t[S::TrailersReceived as usize][E::OnEom as usize] = Some(S::EomQueued);

    t[S::UpgradeComplete as usize][E::OnBody as usize] = Some(S::UpgradeComplete);
    t[S::UpgradeComplete as usize][E::OnEom as usize] = Some(S::EomQueued);

    t[S::EomQueued as usize][E::EomFlushed as usize] = Some(S::ReceivingDone);

    t
}

const fn egress_table() -> EgressTable {
    use EgressEvent as E;
    use EgressState as S;
    let mut t: EgressTable = [[None; EGRESS_EVENTS]; EGRESS_STATES];

    t[S::Start as usize][E::SendHeaders as usize] = Some(S::HeadersSent);

    t[S::HeadersSent as usize][E::SendBody as usize] = Some(S::RegularBodySent);
    t[S::HeadersSent as usize][E::SendChunkHeader as usize] = Some(S::ChunkHeaderSent);
    t[S::HeadersSent as usize][E::SendTrailers as usize] = Some(S::TrailersSent);
    t[S::HeadersSent as usize][E::SendEom as usize] = Some(S::EomQueued);

    t[S::RegularBodySent as usize][E::SendBody as usize] = Some(S::RegularBodySent);
    t[S::RegularBodySent as usize][E::SendTrailers as usize] = Some(S::TrailersSent);
    t[S::RegularBodySent as usize][E::SendEom as usize] = Some(S::EomQueued);

    t[S::ChunkHeaderSent as usize][E::SendBody as usize] = Some(S::ChunkBodySent);

    t[S::ChunkBodySent as usize][E::SendBody as usize] = Some(S::ChunkBodySent);
    t[S::ChunkBodySent as usize][E::SendChunkTerminator as usize] = Some(S::ChunkTerminatorSent);

    t[S::ChunkTerminatorSent as usize][E::SendChunkHeader as usize] = Some(S::ChunkHeaderSent);
    t[S::ChunkTerminatorSent as usize][E::SendTrailers as usize] = Some(S::TrailersSent);
    t[S::ChunkTerminatorSent as usize][E::SendEom as usize] = Some(S::EomQueued);

    t[S::TrailersSent as usize][E::SendEom as usize] = Some(S::EomQueued);

    t[S::EomQueued as usize][E::EomFlushed as usize] = Some(S::SendingDone);

    t
}

static INGRESS_TABLE: IngressTable = ingress_table();
static EGRESS_TABLE: EgressTable = egress_table();

/// Look up an ingress transition. `None` means the event is rejected in
/// the given state.
pub fn ingress_transition(state: IngressState, event: IngressEvent) -> Option<IngressState> {
    INGRESS_TABLE[state as usize][event as usize]
}

/// Look up an egress transition.
pub fn egress_transition(state: EgressState, event: EgressEvent) -> Option<EgressState> {
    EGRESS_TABLE[state as usize][event as usize]
}
