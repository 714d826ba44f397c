//! Fixed GraphQL documents sent to start.gg.

pub const USER_TOURNAMENTS: &str = r#"
query UserTournaments($userId: ID!, $page: Int, $perPage: Int) {
  user(id: $userId) {
    id
    tournaments(query: { page: $page, perPage: $perPage }) {
      nodes {
        id
        name
        slug
        startAt
        endAt
        isOnline
        venueName
        venueAddress
        city
        addrState
        countryCode
        images {
          type
          url
        }
      }
      pageInfo {
        page
        totalPages
      }
    }
  }
}
"#;

pub const TOURNAMENT_WITH_SETS: &str = r#"
query TournamentEvents($tournamentId: ID!, $userId: ID!) {
  tournament(id: $tournamentId) {
    id
    name
    events {
      id
      name
      slug
      numEntrants
      standings(query: { page: 1, perPage: 100 }) {
        nodes {
          placement
          entrant {
            id
            participants {
              gamerTag
              user {
                id
              }
            }
          }
        }
      }
      sets(filters: { participantIds: [$userId] }, page: 1, perPage: 50) {
        nodes {
          id
          round
          fullRoundText
          displayScore
          identifier
          winnerId
          slots {
            standing {
              placement
              entrant {
                id
                participants {
                  gamerTag
                  user {
                    id
                  }
                }
              }
            }
          }
        }
      }
    }
  }
}
"#;

pub const TOURNAMENT_EVENTS: &str = r#"
query TournamentSimple($tournamentId: ID!) {
  tournament(id: $tournamentId) {
    id
    name
    events {
      id
      name
      slug
      numEntrants
    }
  }
}
"#;

pub const EVENT_SETS: &str = r#"
query EventSets($eventId: ID!, $userId: ID!, $page: Int!) {
  event(id: $eventId) {
    id
    sets(filters: { participantIds: [$userId] }, page: $page, perPage: 50) {
      pageInfo {
        page
        totalPages
      }
      nodes {
        id
        round
        fullRoundText
        displayScore
        identifier
        winnerId
        slots {
          standing {
            placement
            entrant {
              id
              participants {
                gamerTag
                user {
                  id
                }
              }
            }
          }
        }
      }
    }
    standings(query: { page: 1, perPage: 100 }) {
      nodes {
        placement
        entrant {
          id
          participants {
            gamerTag
            user {
              id
            }
          }
        }
      }
    }
  }
}
"#;

pub const USER_SETS: &str = r#"
query UserSets($userId: ID!, $page: Int!, $perPage: Int!) {
  user(id: $userId) {
    id
    player {
      sets(page: $page, perPage: $perPage) {
        pageInfo {
          page
          totalPages
        }
        nodes {
          id
          round
          fullRoundText
          displayScore
          identifier
          winnerId
          event {
            id
            name
            slug
            numEntrants
            tournament {
              id
            }
          }
          slots {
            entrant {
              id
              participants {
                gamerTag
                user {
                  id
                }
              }
            }
          }
        }
      }
    }
  }
}
"#;
