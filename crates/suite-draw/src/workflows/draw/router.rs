use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;

use super::domain::{
    Applicant, Clip, ClipId, Draw, DrawAggregate, DrawId, Group, GroupId, LotteryAssignment,
    LotteryId, LotteryOwner, ReminderKind, Suite, SuiteId, SuiteSize,
};
use super::error::DrawError;
use super::lifecycle::{
    DrawLifecycle, LotteryStartOutcome, PhaseOutcome, PickResult, ReminderOutcome,
    SelectionStartOutcome,
};
use super::pruning::{PruneOutcome, PruneTarget};
use super::registry::{GroupRank, SizeDemand};
use super::repository::DrawRepository;
use super::selection::{EligibleGroup, SuiteSelection};

type Lifecycle<R> = State<Arc<DrawLifecycle<R>>>;

/// Router builder exposing the draw control surface.
pub fn draw_router<R>(lifecycle: Arc<DrawLifecycle<R>>) -> Router
where
    R: DrawRepository + 'static,
{
    Router::new()
        .route("/api/v1/draws", post(open_handler::<R>))
        .route("/api/v1/draws/:draw_id", get(draw_handler::<R>))
        .route("/api/v1/draws/:draw_id/activate", post(activate_handler::<R>))
        .route(
            "/api/v1/draws/:draw_id/group-formation",
            post(group_formation_handler::<R>),
        )
        .route(
            "/api/v1/draws/:draw_id/lottery/start",
            post(start_lottery_handler::<R>),
        )
        .route("/api/v1/draws/:draw_id/lottery", post(assign_handler::<R>))
        .route(
            "/api/v1/draws/:draw_id/lottery/:lottery_id",
            delete(retract_handler::<R>),
        )
        .route(
            "/api/v1/draws/:draw_id/selection/start",
            post(start_selection_handler::<R>),
        )
        .route(
            "/api/v1/draws/:draw_id/selection/next",
            get(next_groups_handler::<R>),
        )
        .route(
            "/api/v1/draws/:draw_id/selection/picks",
            post(pick_handler::<R>),
        )
        .route(
            "/api/v1/draws/:draw_id/groups/:group_id",
            delete(withdraw_handler::<R>),
        )
        .route(
            "/api/v1/draws/:draw_id/groups/:group_id/suite",
            delete(remove_suite_handler::<R>),
        )
        .route(
            "/api/v1/draws/:draw_id/groups/:group_id/ranking",
            get(ranking_handler::<R>),
        )
        .route("/api/v1/draws/:draw_id/prune", post(prune_handler::<R>))
        .route(
            "/api/v1/draws/:draw_id/oversubscription",
            get(oversubscription_handler::<R>),
        )
        .route(
            "/api/v1/draws/:draw_id/reminders",
            post(reminder_handler::<R>),
        )
        .with_state(lifecycle)
}

#[derive(Debug, Deserialize)]
pub struct OpenDrawRequest {
    pub id: DrawId,
    pub name: String,
    #[serde(default)]
    pub intent_deadline: Option<NaiveDate>,
    #[serde(default)]
    pub locking_deadline: Option<NaiveDate>,
    #[serde(default)]
    pub applicants: Vec<Applicant>,
    #[serde(default)]
    pub suites: Vec<Suite>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub clips: Vec<Clip>,
}

impl OpenDrawRequest {
    fn into_aggregate(self) -> DrawAggregate {
        let draw = Draw::new(self.id, self.name)
            .with_deadlines(self.intent_deadline, self.locking_deadline);
        let mut aggregate = DrawAggregate::new(draw);
        aggregate.applicants = self.applicants;
        aggregate.suites = self.suites;
        aggregate.groups = self.groups;
        aggregate.clips = self.clips;
        aggregate
    }
}

#[derive(Debug, Deserialize)]
pub struct AssignNumberRequest {
    pub number: i64,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub clip_id: Option<ClipId>,
}

impl AssignNumberRequest {
    fn owner(&self) -> Result<LotteryOwner, DrawError> {
        match (&self.group_id, &self.clip_id) {
            (Some(group), None) => Ok(LotteryOwner::Group(group.clone())),
            (None, Some(clip)) => Ok(LotteryOwner::Clip(clip.clone())),
            _ => Err(DrawError::invalid(
                "Provide exactly one of group_id or clip_id.",
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PickRequest {
    pub group_id: GroupId,
    #[serde(default)]
    pub suite_id: Option<SuiteId>,
    #[serde(default)]
    pub selections: Vec<SuiteSelection>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PruneSize {
    Size(SuiteSize),
    Keyword(String),
}

#[derive(Debug, Default, Deserialize)]
pub struct PruneRequest {
    #[serde(default)]
    pub size: Option<PruneSize>,
}

impl PruneRequest {
    fn target(&self) -> Result<PruneTarget, DrawError> {
        match &self.size {
            None => Ok(PruneTarget::Oversubscribed),
            Some(PruneSize::Size(size)) => Ok(PruneTarget::Size(*size)),
            Some(PruneSize::Keyword(keyword)) if keyword == "all" => {
                Ok(PruneTarget::Oversubscribed)
            }
            Some(PruneSize::Keyword(other)) => Err(DrawError::invalid(format!(
                "Prune size must be a suite size or \"all\", not \"{other}\"."
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReminderRequest {
    pub kind: ReminderKind,
    #[serde(default)]
    pub today: Option<NaiveDate>,
}

async fn open_handler<R>(
    State(lifecycle): Lifecycle<R>,
    Json(request): Json<OpenDrawRequest>,
) -> Result<(StatusCode, Json<DrawAggregate>), DrawError>
where
    R: DrawRepository + 'static,
{
    let stored = lifecycle.open_draw(request.into_aggregate())?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn draw_handler<R>(
    State(lifecycle): Lifecycle<R>,
    Path(draw_id): Path<String>,
) -> Result<Json<DrawAggregate>, DrawError>
where
    R: DrawRepository + 'static,
{
    lifecycle.draw(&DrawId(draw_id)).map(Json)
}

async fn activate_handler<R>(
    State(lifecycle): Lifecycle<R>,
    Path(draw_id): Path<String>,
) -> Result<Json<PhaseOutcome>, DrawError>
where
    R: DrawRepository + 'static,
{
    lifecycle.activate(&DrawId(draw_id)).map(Json)
}

async fn group_formation_handler<R>(
    State(lifecycle): Lifecycle<R>,
    Path(draw_id): Path<String>,
) -> Result<Json<PhaseOutcome>, DrawError>
where
    R: DrawRepository + 'static,
{
    lifecycle
        .proceed_to_group_formation(&DrawId(draw_id))
        .map(Json)
}

async fn start_lottery_handler<R>(
    State(lifecycle): Lifecycle<R>,
    Path(draw_id): Path<String>,
) -> Result<Json<LotteryStartOutcome>, DrawError>
where
    R: DrawRepository + 'static,
{
    lifecycle.start_lottery(&DrawId(draw_id)).map(Json)
}

async fn assign_handler<R>(
    State(lifecycle): Lifecycle<R>,
    Path(draw_id): Path<String>,
    Json(request): Json<AssignNumberRequest>,
) -> Result<(StatusCode, Json<LotteryAssignment>), DrawError>
where
    R: DrawRepository + 'static,
{
    let owner = request.owner()?;
    let assignment = lifecycle.assign_lottery_number(&DrawId(draw_id), request.number, owner)?;
    Ok((StatusCode::CREATED, Json(assignment)))
}

async fn retract_handler<R>(
    State(lifecycle): Lifecycle<R>,
    Path((draw_id, lottery_id)): Path<(String, String)>,
) -> Result<Json<LotteryAssignment>, DrawError>
where
    R: DrawRepository + 'static,
{
    lifecycle
        .retract_lottery_number(&DrawId(draw_id), &LotteryId(lottery_id))
        .map(Json)
}

async fn start_selection_handler<R>(
    State(lifecycle): Lifecycle<R>,
    Path(draw_id): Path<String>,
) -> Result<Json<SelectionStartOutcome>, DrawError>
where
    R: DrawRepository + 'static,
{
    lifecycle.start_selection(&DrawId(draw_id)).map(Json)
}

async fn next_groups_handler<R>(
    State(lifecycle): Lifecycle<R>,
    Path(draw_id): Path<String>,
) -> Result<Json<Vec<EligibleGroup>>, DrawError>
where
    R: DrawRepository + 'static,
{
    lifecycle.next_groups(&DrawId(draw_id)).map(Json)
}

async fn pick_handler<R>(
    State(lifecycle): Lifecycle<R>,
    Path(draw_id): Path<String>,
    Json(request): Json<PickRequest>,
) -> Result<Json<PickResult>, DrawError>
where
    R: DrawRepository + 'static,
{
    let draw_id = DrawId(draw_id);
    let PickRequest {
        group_id,
        suite_id,
        selections,
    } = request;
    let result = match (suite_id, selections.is_empty()) {
        (Some(suite_id), true) => lifecycle.pick_suite(&draw_id, &group_id, &suite_id),
        (None, false) => lifecycle.pick_suites(&draw_id, &group_id, &selections),
        _ => Err(DrawError::invalid(
            "Provide either suite_id or a list of selections.",
        )),
    };
    result.map(Json)
}

async fn withdraw_handler<R>(
    State(lifecycle): Lifecycle<R>,
    Path((draw_id, group_id)): Path<(String, String)>,
) -> Result<StatusCode, DrawError>
where
    R: DrawRepository + 'static,
{
    lifecycle.withdraw_group(&DrawId(draw_id), &GroupId(group_id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_suite_handler<R>(
    State(lifecycle): Lifecycle<R>,
    Path((draw_id, group_id)): Path<(String, String)>,
) -> Result<StatusCode, DrawError>
where
    R: DrawRepository + 'static,
{
    lifecycle.remove_suite(&DrawId(draw_id), &GroupId(group_id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ranking_handler<R>(
    State(lifecycle): Lifecycle<R>,
    Path((draw_id, group_id)): Path<(String, String)>,
) -> Result<Json<GroupRank>, DrawError>
where
    R: DrawRepository + 'static,
{
    lifecycle
        .ranking(&DrawId(draw_id), &GroupId(group_id))
        .map(Json)
}

async fn prune_handler<R>(
    State(lifecycle): Lifecycle<R>,
    Path(draw_id): Path<String>,
    Json(request): Json<PruneRequest>,
) -> Result<Json<PruneOutcome>, DrawError>
where
    R: DrawRepository + 'static,
{
    let target = request.target()?;
    lifecycle.prune(&DrawId(draw_id), target).map(Json)
}

async fn oversubscription_handler<R>(
    State(lifecycle): Lifecycle<R>,
    Path(draw_id): Path<String>,
) -> Result<Json<Vec<SizeDemand>>, DrawError>
where
    R: DrawRepository + 'static,
{
    lifecycle.oversubscription(&DrawId(draw_id)).map(Json)
}

async fn reminder_handler<R>(
    State(lifecycle): Lifecycle<R>,
    Path(draw_id): Path<String>,
    Json(request): Json<ReminderRequest>,
) -> Result<Json<ReminderOutcome>, DrawError>
where
    R: DrawRepository + 'static,
{
    let now = Utc::now();
    let today = request.today.unwrap_or_else(|| now.date_naive());
    lifecycle
        .queue_reminder(&DrawId(draw_id), request.kind, today, now)
        .map(Json)
}
